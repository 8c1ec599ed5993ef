//! Tool name constants and capability groupings used by the planner.

pub const TASK_FINISH: &str = "task_finish";
pub const ASK_USER: &str = "ask_user";
pub const TODO_WRITE: &str = "todo_write";
pub const COMPRESS_MEMORY: &str = "compress_memory";

pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const LIST_FILES: &str = "list_files";
pub const FILE_INFO: &str = "file_info";
pub const FILE_STR_REPLACE: &str = "file_str_replace";
pub const WORKSPACE_GREP: &str = "workspace_grep";

pub const BASH: &str = "bash";
pub const CHECK_BACKGROUND_COMMAND: &str = "check_background_command";
pub const READ_IMAGE: &str = "read_image";

pub const CREATE_SUB_TASK: &str = "create_sub_task";
pub const BATCH_SUB_TASKS: &str = "batch_sub_tasks";

/// Workspace file tools, visible when `use_workspace` is set.
pub const WORKSPACE_TOOLS: &[&str] = &[
    LIST_FILES,
    FILE_INFO,
    READ_FILE,
    WRITE_FILE,
    FILE_STR_REPLACE,
    WORKSPACE_GREP,
];

/// Document tools; enabled by `enable_document_tools`, otherwise their
/// handlers answer with a standardized `not_enabled` error.
pub const DOCUMENT_NAVIGATION_TOOLS: &[&str] = &[
    "list_mounted_documents",
    "read_document_content",
    "document_grep",
    "read_document_abstract",
    "read_document_overview",
    "read_folder_abstract",
    "document_find",
];

/// Workflow tools; same gating as the document tools.
pub const WORKFLOW_TOOLS: &[&str] = &["create_workflow", "run_workflow"];

/// Error code reported by `task_finish` while TODO items are open.
pub const TODO_INCOMPLETE_ERROR_CODE: &str = "todo_incomplete";
