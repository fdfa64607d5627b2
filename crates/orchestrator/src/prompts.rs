use flowforge_core::{AgentRole, Requirements};

pub struct AgentPrompts;

impl AgentPrompts {
    pub fn system(role: AgentRole) -> &'static str {
        match role {
            AgentRole::Architect => {
                "You are the Architect. You clarify requirements, present options and design \
                 workflow blueprints. You never create or modify workflows yourself. \
                 Always finish with a single ```json block matching the requested shape."
            }
            AgentRole::Researcher => {
                "You are the Researcher. You search for nodes, templates and existing workflows, \
                 inspect execution history and validate hypotheses with evidence. You never \
                 modify workflows. Always finish with a single ```json block."
            }
            AgentRole::Builder => {
                "You are the Builder, the only agent allowed to create or modify workflows. \
                 Touch only the nodes in the edit scope and never repeat an approach listed \
                 under ALREADY TRIED. Always finish with a single ```json block."
            }
            AgentRole::Qa => {
                "You are QA. You validate workflows and run live test executions. Report PASS \
                 only after a live test has actually run. Always finish with a single \
                 ```json block."
            }
            AgentRole::Analyst => {
                "You are the Analyst. You read session history and audit trails, find root \
                 causes and propose learnings. You never modify workflows. Always finish with \
                 a single ```json block."
            }
        }
    }

    /// Wraps a task with its structured context.
    pub fn task_prompt(task: &str, context: &serde_json::Value) -> String {
        let mut prompt = format!("## TASK\n\n{}\n", task);

        if let Some(map) = context.as_object().filter(|m| !m.is_empty()) {
            prompt.push_str("\n## CONTEXT\n");
            for (key, value) in map {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => serde_json::to_string_pretty(other).unwrap_or_default(),
                };
                prompt.push_str(&format!("\n### {}\n{}\n", key, rendered));
            }
        }
        prompt
    }

    pub fn clarify(request: &str) -> String {
        format!(
            r#"Analyze the user's request and decide what happens next.

## Request
{request}

If this is a greeting or a question rather than a build request, set
`is_conversational` to true and put your reply in `response`.
Record any explicit numeric constraint (e.g. "at least 5 nodes") in
`explicit_requirements.min_nodes`.

```json
{{"requirements": "", "complexity": "simple|medium|complex", "needs_research": false,
  "is_conversational": false, "response": null, "node_count": null,
  "explicit_requirements": {{"min_nodes": null, "notes": []}}, "questions": []}}
```"#
        )
    }

    pub fn search(query: &str) -> String {
        format!(
            r#"Research how to implement this workflow. Search nodes, templates and existing
workflows, then state and validate a hypothesis.

## Query
{query}

```json
{{"hypothesis": "", "hypothesis_validated": false, "fit_score": 0,
  "templates_found": [], "nodes_found": [], "existing_workflows": [],
  "summary": "", "ready_for_blueprint": false}}
```"#
        )
    }

    pub fn present_options() -> String {
        r#"Using the research findings in CONTEXT, propose up to three ranked implementation
options. Mark exactly one as recommended.

```json
{"options": [{"name": "", "description": "", "score": 0, "recommended": false,
  "pros": [], "cons": []}]}
```"#
            .to_string()
    }

    pub fn create_blueprint(option: &str, requirements: Option<&Requirements>) -> String {
        let mut constraints = String::new();
        if let Some(req) = requirements {
            if let Some(min) = req.min_node_count {
                constraints.push_str(&format!(
                    "- ENFORCED: the blueprint must contain at least {} nodes\n",
                    min
                ));
            }
            for c in &req.constraints {
                constraints.push_str(&format!("- ENFORCED: {}\n", c));
            }
        }
        if constraints.is_empty() {
            constraints.push_str("- none\n");
        }

        format!(
            r#"Create a blueprint for the selected option.

## Selected option
{option}

## User constraints
{constraints}
`required_credentials` must always be present (use [] when none are needed).

```json
{{"name": "", "description": "", "trigger": "",
  "nodes": [{{"name": "", "type": "", "purpose": ""}}],
  "connections": [{{"from": "", "to": ""}}], "required_credentials": []}}
```"#
        )
    }

    pub fn discover_credentials(types: &[String]) -> String {
        format!(
            r#"List the credentials available in the workflow system that match these types:
{}

```json
{{"available": [{{"id": "", "name": "", "type": ""}}]}}
```"#,
            types.join(", ")
        )
    }

    pub fn select_credentials() -> String {
        r#"Match the needed credential types in CONTEXT against the discovered credentials.
List every type with no match under `missing`.

```json
{"selected": [{"credential_type": "", "credential_id": ""}], "missing": []}
```"#
            .to_string()
    }

    pub fn build() -> String {
        r#"Create the workflow described by the blueprint in CONTEXT, following the research
guidance. Validate it before finishing.

```json
{"resource_id": "", "name": "", "node_count": 0, "version": null, "notes": ""}
```"#
            .to_string()
    }

    pub fn fix(
        resource_id: &str,
        edit_scope: &[String],
        errors: &str,
        already_tried: &str,
    ) -> String {
        let scope = if edit_scope.is_empty() {
            "(unspecified, keep changes minimal)".to_string()
        } else {
            edit_scope.join(", ")
        };
        format!(
            r#"Fix workflow {resource_id}.

## Errors
{errors}

## Edit scope
Only modify these nodes: {scope}
Use partial updates. Do not recreate the workflow.

{already_tried}
```json
{{"resource_id": "{resource_id}", "changes": [],
  "verification": {{"expected_changes_applied": false, "version_changed": false}}}}
```"#
        )
    }

    pub fn validate(resource_id: &str) -> String {
        format!(
            r#"Validate workflow {resource_id} structurally and semantically, then run a live test.
List errors per node and the minimal edit scope for a fix.

```json
{{"status": "PASS|FAIL|BLOCKED", "errors": [{{"node": null, "message": ""}}],
  "warnings": [], "edit_scope": [], "live_test_executed": false, "summary": ""}}
```"#
        )
    }

    pub fn test_workflow(resource_id: &str) -> String {
        format!(
            r#"Run a live test execution of workflow {resource_id} and report each run.

```json
{{"tests": [{{"name": "", "success": false, "execution_id": null, "error": null}}],
  "summary": ""}}
```"#
        )
    }

    pub fn analyze_execution(resource_id: &str, errors: &str) -> String {
        format!(
            r#"Investigate the latest failed execution of workflow {resource_id}.
Step 1: inspect executions with mode "summary". Step 2: inspect the failing nodes
with mode "filtered". Then state and validate a hypothesis for an alternative fix.

## Reported errors
{errors}

```json
{{"hypothesis": "", "hypothesis_validated": false, "root_cause": "",
  "failing_nodes": [], "recommended_fix": "", "rejected_approaches": []}}
```"#
        )
    }

    pub fn deep_dive(resource_id: &str, already_tried: &str) -> String {
        format!(
            r#"Deep-dive review of workflow {resource_id}: every approach below has failed.
Inspect executions with mode "summary" and mode "filtered", re-read the node
configuration, and find what all previous attempts missed.

{already_tried}
```json
{{"hypothesis": "", "hypothesis_validated": false, "root_cause": "",
  "failing_nodes": [], "recommended_fix": "", "rejected_approaches": []}}
```"#
        )
    }

    pub fn post_mortem(resource_id: Option<&str>, cause: &str) -> String {
        format!(
            r#"The session is blocked. Produce a post-mortem.

## Workflow
{resource}

## Blocking cause
{cause}

Grade each agent from 0 to 10. Propose learnings and context updates only when
they are reusable beyond this session.

```json
{{"root_cause": "", "timeline": [{{"at": "", "agent": "", "event": ""}}],
  "agent_grades": [{{"agent": "", "score": 0, "notes": ""}}],
  "learnings": [{{"title": "", "category": "", "severity": "", "body": ""}}],
  "context_updates": [{{"section": "", "content": ""}}], "recommendations": []}}
```"#,
            resource = resource_id.unwrap_or("(not created)")
        )
    }

    pub fn answer_question(from: AgentRole, question: &str) -> String {
        format!(
            r#"The {from} asks:

{question}

Answer from what you already know about this workflow.

```json
{{"answer": ""}}
```"#
        )
    }

    pub fn analyze_project(workflow_id: &str) -> String {
        format!(
            r#"Read the project documents in CONTEXT and explain what workflow {workflow_id}
is supposed to do. List concerns and questions for the investigator.

```json
{{"project_summary": "", "intended_behavior": "", "concerns": [], "open_questions": []}}
```"#
        )
    }

    pub fn fetch_snapshot(workflow_id: &str) -> String {
        format!(
            r#"Fetch workflow {workflow_id} and its recent execution history (mode "summary").

```json
{{"id": "{workflow_id}", "name": "", "active": false, "nodes": [{{"name": "", "type": ""}}],
  "executions": [{{"id": "", "status": "", "started_at": null, "error": null}}]}}
```"#
        )
    }

    pub fn audit_workflow(workflow_id: &str) -> String {
        format!(
            r#"Audit workflow {workflow_id} against the intended behavior in CONTEXT. Inspect
failed executions. Put anything only the architect can answer in `open_questions`.

```json
{{"issues": [{{"node": null, "severity": "", "description": ""}}],
  "execution_summary": "", "hypothesis": "", "open_questions": []}}
```"#
        )
    }

    pub fn synthesize_report(workflow_id: &str) -> String {
        format!(
            r#"Synthesize the architect context and researcher findings in CONTEXT into a
final audit report for workflow {workflow_id}. Put anything only the researcher can
answer in `open_questions`.

```json
{{"summary": "", "root_causes": [], "recommendations": [], "risk_level": "low|medium|high",
  "open_questions": []}}
```"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_prompt_sections() {
        let prompt = AgentPrompts::task_prompt(
            "Build it",
            &json!({ "blueprint": { "name": "digest" }, "note": "keep it small" }),
        );

        assert!(prompt.starts_with("## TASK\n\nBuild it"));
        assert!(prompt.contains("## CONTEXT"));
        assert!(prompt.contains("### blueprint"));
        assert!(prompt.contains("### note\nkeep it small"));
    }

    #[test]
    fn test_task_prompt_without_context() {
        let prompt = AgentPrompts::task_prompt("Hello", &json!({}));
        assert!(!prompt.contains("CONTEXT"));
    }

    #[test]
    fn test_blueprint_prompt_enforces_min_nodes() {
        let req = Requirements {
            min_node_count: Some(5),
            constraints: vec!["use Slack".to_string()],
        };
        let prompt = AgentPrompts::create_blueprint("Option A", Some(&req));

        assert!(prompt.contains("at least 5 nodes"));
        assert!(prompt.contains("ENFORCED: use Slack"));
    }

    #[test]
    fn test_fix_prompt_includes_scope_and_history() {
        let prompt = AgentPrompts::fix(
            "wf-1",
            &["HTTP".to_string(), "Set".to_string()],
            "HTTP: 401",
            "## ALREADY TRIED (DO NOT REPEAT!)",
        );

        assert!(prompt.contains("Only modify these nodes: HTTP, Set"));
        assert!(prompt.contains("ALREADY TRIED"));
    }

    #[test]
    fn test_every_role_has_system_prompt() {
        for role in AgentRole::ALL {
            assert!(!AgentPrompts::system(role).is_empty());
        }
    }
}
