//! Tool Planner
//!
//! Projects the registry onto the tool list one cycle may see, driven by
//! the task's capability flags and the current memory pressure.

use serde_json::Value;

use crate::tools::names::{
    ASK_USER, BASH, BATCH_SUB_TASKS, CHECK_BACKGROUND_COMMAND, COMPRESS_MEMORY, CREATE_SUB_TASK,
    DOCUMENT_NAVIGATION_TOOLS, READ_IMAGE, TASK_FINISH, TODO_WRITE, WORKFLOW_TOOLS,
    WORKSPACE_TOOLS,
};
use crate::tools::ToolRegistry;
use crate::types::AgentTask;

/// Ordered tool names visible to the given task this cycle.
pub fn plan_tool_names(task: &AgentTask, memory_usage_percentage: u8) -> Vec<String> {
    let mut names: Vec<&str> = vec![TASK_FINISH, ASK_USER, TODO_WRITE];

    if task.use_workspace {
        names.extend(WORKSPACE_TOOLS);
    }

    if memory_usage_percentage >= task.memory_threshold_percentage {
        names.push(COMPRESS_MEMORY);
    }

    if task.agent_type.as_deref() == Some("computer") {
        names.extend([BASH, CHECK_BACKGROUND_COMMAND, READ_IMAGE]);
    }

    if task.native_multimodal {
        names.push(READ_IMAGE);
    }

    if task.sub_agents_enabled() {
        names.extend([CREATE_SUB_TASK, BATCH_SUB_TASKS]);
    }

    if task.enable_document_tools {
        names.extend(DOCUMENT_NAVIGATION_TOOLS);
    }

    if task.enable_workflow_tools {
        names.extend(WORKFLOW_TOOLS);
    }

    let mut planned: Vec<String> = names.into_iter().map(str::to_string).collect();
    planned.extend(task.extra_tool_names.iter().cloned());

    let excluded: std::collections::HashSet<&str> =
        task.exclude_tools.iter().map(String::as_str).collect();

    let mut seen = std::collections::HashSet::new();
    planned
        .into_iter()
        .filter(|name| !excluded.contains(name.as_str()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Schemas for the planned tools, in planning order, restricted to tools
/// actually present in the registry.
pub fn plan_tool_schemas(
    registry: &ToolRegistry,
    task: &AgentTask,
    memory_usage_percentage: u8,
) -> Vec<Value> {
    let names = plan_tool_names(task, memory_usage_percentage);
    registry.list_schemas(&names)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::build_default_registry;
    use crate::types::SubAgentConfig;

    fn task() -> AgentTask {
        AgentTask::new("t1", "test-model", "sys", "user")
    }

    #[test]
    fn control_tools_always_present() {
        let mut task = task();
        task.use_workspace = false;
        let names = plan_tool_names(&task, 0);
        assert!(names.contains(&TASK_FINISH.to_string()));
        assert!(names.contains(&ASK_USER.to_string()));
        assert!(names.contains(&TODO_WRITE.to_string()));
        assert!(!names.contains(&"read_file".to_string()));
    }

    #[test]
    fn workspace_tools_follow_flag() {
        let names = plan_tool_names(&task(), 0);
        assert!(names.contains(&"read_file".to_string()));
        assert!(names.contains(&"workspace_grep".to_string()));
    }

    #[test]
    fn compress_memory_appears_under_pressure() {
        let task = task();
        assert!(!plan_tool_names(&task, 89).contains(&COMPRESS_MEMORY.to_string()));
        assert!(plan_tool_names(&task, 90).contains(&COMPRESS_MEMORY.to_string()));
    }

    #[test]
    fn computer_agents_get_compute_tools() {
        let mut task = task();
        task.agent_type = Some("computer".into());
        let names = plan_tool_names(&task, 0);
        assert!(names.contains(&BASH.to_string()));
        assert!(names.contains(&CHECK_BACKGROUND_COMMAND.to_string()));
        assert!(names.contains(&READ_IMAGE.to_string()));
    }

    #[test]
    fn multimodal_gets_read_image_without_duplicates() {
        let mut task = task();
        task.agent_type = Some("computer".into());
        task.native_multimodal = true;
        let names = plan_tool_names(&task, 0);
        let image_count = names.iter().filter(|n| *n == READ_IMAGE).count();
        assert_eq!(image_count, 1);
    }

    #[test]
    fn sub_agent_tools_require_configured_agents() {
        let mut task = task();
        assert!(!plan_tool_names(&task, 0).contains(&CREATE_SUB_TASK.to_string()));

        task.sub_agents
            .insert("researcher".into(), SubAgentConfig::new("m", "does research"));
        let names = plan_tool_names(&task, 0);
        assert!(names.contains(&CREATE_SUB_TASK.to_string()));
        assert!(names.contains(&BATCH_SUB_TASKS.to_string()));
    }

    #[test]
    fn document_and_workflow_tools_gated() {
        let mut task = task();
        assert!(!plan_tool_names(&task, 0).contains(&"document_grep".to_string()));
        task.enable_document_tools = true;
        task.enable_workflow_tools = true;
        let names = plan_tool_names(&task, 0);
        assert!(names.contains(&"document_grep".to_string()));
        assert!(names.contains(&"run_workflow".to_string()));
    }

    #[test]
    fn exclusions_apply_last() {
        let mut task = task();
        task.exclude_tools = vec!["read_file".into(), ASK_USER.into()];
        let names = plan_tool_names(&task, 0);
        assert!(!names.contains(&"read_file".to_string()));
        assert!(!names.contains(&ASK_USER.to_string()));
    }

    #[test]
    fn schemas_match_registered_tools_only() {
        let registry = build_default_registry();
        let mut task = task();
        task.extra_tool_names = vec!["unregistered_tool".into()];
        let schemas = plan_tool_schemas(&registry, &task, 0);
        let names: Vec<String> = schemas
            .iter()
            .filter_map(crate::llm::schema_tool_name)
            .collect();
        assert!(names.contains(&TASK_FINISH.to_string()));
        assert!(!names.contains(&"unregistered_tool".to_string()));
        // Planner order starts with the control tools.
        assert_eq!(names[0], TASK_FINISH);
    }
}
