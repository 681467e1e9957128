//! Read-only description of a workflow's step graph.

use crate::workflow::Definition;
use serde::Serialize;
use tsuzuri_core::{BranchTarget, Step, StepId, StepKind};

/// Serializable view of a workflow, for visualizers and other tooling.
///
/// ```
/// use tsuzuri::prelude::*;
/// use serde_json::json;
///
/// let workflow = Workflow::builder("wf")
///     .add_step(FnStep::map("a", Ok))
///     .add_step(FnStep::map("b", Ok))
///     .build()
///     .unwrap();
///
/// let graph = serde_json::to_value(workflow.inspect()).unwrap();
/// assert_eq!(graph["nodes"][1]["id"], json!("b"));
/// assert_eq!(graph["edges"][1]["to"], json!("end"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowGraph {
    /// The workflow id.
    pub id: String,
    /// Human-readable description, if one was set.
    pub description: Option<String>,
    /// Name of the workflow's input schema, if any.
    pub input_schema: Option<String>,
    /// Name of the workflow's output schema, if any.
    pub output_schema: Option<String>,
    /// Top-level steps in declaration order.
    pub nodes: Vec<StepNode>,
    /// Transitions between top-level steps.
    pub edges: Vec<Edge>,
}

/// One step, with composite steps listing their nested steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepNode {
    /// The step id.
    pub id: StepId,
    /// What sort of step this is.
    pub kind: StepKind,
    /// Position among its siblings.
    pub order: usize,
    /// Name of the input schema, if any.
    pub input_schema: Option<String>,
    /// Name of the output schema, if any.
    pub output_schema: Option<String>,
    /// Targets declared by a condition step.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchTarget>,
    /// Nested steps of a composite step.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepNode>,
}

/// How control may pass from one top-level step to another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    /// Step control leaves.
    pub from: StepId,
    /// Step control enters, or the end of the run.
    pub to: BranchTarget,
    /// Whether the transition is ordinary sequencing or a declared branch.
    pub kind: EdgeKind,
}

/// Origin of an [`Edge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// The next step in order.
    Sequential,
    /// A target declared by a condition step.
    Branch,
}

impl WorkflowGraph {
    pub(crate) fn from_definition(definition: &Definition) -> Self {
        let steps = &definition.steps;
        let nodes = steps
            .iter()
            .enumerate()
            .map(|(order, step)| StepNode::new(&**step, order))
            .collect();

        // A condition step always replaces sequential flow, so one without
        // declared branches has no edge the graph can show.
        let mut edges = Vec::new();
        for (index, step) in steps.iter().enumerate() {
            let declared = step.declared_branches();
            if declared.is_empty() && step.kind() == StepKind::Condition {
                continue;
            }
            if declared.is_empty() {
                let to = match steps.get(index + 1) {
                    Some(next) => BranchTarget::Step(next.id().clone()),
                    None => BranchTarget::End,
                };
                edges.push(Edge {
                    from: step.id().clone(),
                    to,
                    kind: EdgeKind::Sequential,
                });
            } else {
                edges.extend(declared.into_iter().map(|to| Edge {
                    from: step.id().clone(),
                    to,
                    kind: EdgeKind::Branch,
                }));
            }
        }

        Self {
            id: definition.id.clone(),
            description: definition.description.clone(),
            input_schema: definition.input_schema.as_ref().map(|s| s.name().to_string()),
            output_schema: definition.output_schema.as_ref().map(|s| s.name().to_string()),
            nodes,
            edges,
        }
    }

    /// Returns the top-level node with the given id.
    pub fn node(&self, id: &str) -> Option<&StepNode> {
        self.nodes.iter().find(|node| node.id == id)
    }
}

impl StepNode {
    fn new(step: &dyn Step, order: usize) -> Self {
        Self {
            id: step.id().clone(),
            kind: step.kind(),
            order,
            input_schema: step.input_schema().map(|s| s.name().to_string()),
            output_schema: step.output_schema().map(|s| s.name().to_string()),
            branches: step.declared_branches(),
            children: step
                .children()
                .into_iter()
                .enumerate()
                .map(|(order, child)| StepNode::new(child, order))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionStep;
    use crate::fn_step::FnStep;
    use crate::for_each::ForEachStep;
    use crate::while_loop::WhileStep;
    use crate::workflow::Workflow;
    use serde_json::json;
    use tsuzuri_core::TypedSchema;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Order {
        id: u64,
    }

    fn graph() -> WorkflowGraph {
        let check = FnStep::map("check", |_| Ok(json!(false)));
        let bump = FnStep::map("bump", Ok);
        Workflow::builder("orders")
            .description("order pipeline")
            .input_schema(TypedSchema::<Order>::new())
            .add_step(
                ConditionStep::new("route", |_| BranchTarget::End)
                    .branches(["fan"])
                    .may_end(),
            )
            .add_step(ForEachStep::new("fan", FnStep::map("item", Ok)))
            .add_step(
                WhileStep::builder("retry", check, bump)
                    .max_iterations(3)
                    .build()
                    .expect("bounded"),
            )
            .build()
            .expect("valid workflow")
            .inspect()
    }

    #[test]
    fn test_nodes_describe_steps() {
        let graph = graph();

        assert_eq!(graph.id, "orders");
        assert_eq!(graph.input_schema.as_deref(), Some("Order"));
        assert_eq!(graph.nodes.len(), 3);

        let fan = graph.node("fan").expect("fan node");
        assert_eq!(fan.kind, StepKind::ForEach);
        assert_eq!(fan.order, 1);
        assert_eq!(fan.children[0].id, "item");

        let retry = graph.node("retry").expect("retry node");
        assert_eq!(retry.kind, StepKind::While);
        let children: Vec<&str> = retry.children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(children, vec!["check", "bump"]);
    }

    #[test]
    fn test_edges() {
        let graph = graph();

        assert_eq!(
            graph.edges,
            vec![
                Edge {
                    from: StepId::new("route"),
                    to: BranchTarget::to("fan"),
                    kind: EdgeKind::Branch,
                },
                Edge {
                    from: StepId::new("route"),
                    to: BranchTarget::End,
                    kind: EdgeKind::Branch,
                },
                Edge {
                    from: StepId::new("fan"),
                    to: BranchTarget::to("retry"),
                    kind: EdgeKind::Sequential,
                },
                Edge {
                    from: StepId::new("retry"),
                    to: BranchTarget::End,
                    kind: EdgeKind::Sequential,
                },
            ]
        );
    }

    #[test]
    fn test_undeclared_condition_has_no_edges() {
        let graph = Workflow::builder("dynamic")
            .add_step(ConditionStep::new("pick", |_| BranchTarget::to("second")))
            .add_step(FnStep::map("first", Ok))
            .add_step(FnStep::map("second", Ok))
            .build()
            .expect("valid workflow")
            .inspect();

        assert!(graph.edges.iter().all(|edge| edge.from != "pick"));
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edges[0].from, "first");
        assert_eq!(graph.edges[0].to, BranchTarget::to("second"));
    }

    #[test]
    fn test_serializes_to_json() {
        let value = serde_json::to_value(graph()).expect("serializable");

        assert_eq!(value["nodes"][0]["kind"], json!("condition"));
        assert_eq!(value["edges"][0]["to"], json!({"step": "fan"}));
        assert_eq!(value["edges"][0]["kind"], json!("branch"));
    }
}
