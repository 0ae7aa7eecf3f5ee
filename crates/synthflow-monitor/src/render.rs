use crate::session::SessionView;
use synthflow_core::pipeline::EntryOrigin;

/// One-line summary printed by `synthflow watch`.
pub fn summary_line(session: &SessionView) -> String {
    let view = &session.view;
    let workflow = &view.workflow;
    let pipeline = if view.pipeline.is_empty() {
        "-".to_string()
    } else {
        view.pipeline
            .iter()
            .map(|entry| match entry.origin {
                EntryOrigin::Reported => entry.stage.as_str().to_string(),
                EntryOrigin::Inferred => format!("{}*", entry.stage.as_str()),
            })
            .collect::<Vec<_>>()
            .join(" > ")
    };

    let mut line = format!(
        "[{}] {} {:.0}% cost={:.2} pipeline: {} agents={} log={}",
        workflow.id,
        workflow.status,
        workflow.progress,
        workflow.cost_accrued,
        pipeline,
        view.agents.len(),
        view.activity_log.len(),
    );
    if let Some(stage) = &workflow.current_stage {
        line.push_str(&format!(" stage={stage}"));
    }
    if let Some(error) = &workflow.error {
        line.push_str(&format!(" error=\"{error}\""));
    }
    if let Some(banner) = session.banner() {
        line.push_str(&format!(" !! {banner}"));
    }
    line
}
