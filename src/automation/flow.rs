//! Static first-contact flow: an ordered list of (delay, message) steps.

use std::time::Duration;

use crate::config::{FlowSettings, Settings};

/// Template token replaced with the booking link.
pub const LINK_TOKEN: &str = "{LINK_AULA}";

const BOOKING_PATH: &str = "/marcar-aula";
const FALLBACK_HOST: &str = "localhost:3000";

/// Absolute booking link. `PUBLIC_BASE_URL` wins; otherwise the link is
/// built from the request host (plain http for local hosts).
pub fn booking_link(settings: &Settings, host: Option<&str>) -> String {
    if let Some(base) = settings.public_base_url() {
        return format!("{base}{BOOKING_PATH}");
    }
    let host = host.map(str::trim).filter(|h| !h.is_empty()).unwrap_or(FALLBACK_HOST);
    let scheme = if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        "http"
    } else {
        "https"
    };
    format!("{scheme}://{host}{BOOKING_PATH}")
}

pub fn render(template: &str, link: &str) -> String {
    template.replace(LINK_TOKEN, link)
}

/// One scheduled send.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStep {
    /// 1-based position in the flow.
    pub index: usize,
    /// Wait before this step starts (zero for the first step).
    pub delay_before: Duration,
    /// Typing simulation between the presence signal and the send.
    pub typing: Duration,
    pub body: String,
}

impl FlowStep {
    /// Audit type tag for this step.
    pub fn kind(&self) -> String {
        format!("flow_step_{}", self.index)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowPlan {
    steps: Vec<FlowStep>,
}

impl FlowPlan {
    /// Render every template and lay the steps out in time.
    pub fn build(flow: &FlowSettings, link: &str) -> Self {
        let steps = flow
            .templates
            .iter()
            .enumerate()
            .map(|(i, template)| FlowStep {
                index: i + 1,
                delay_before: if i == 0 { Duration::ZERO } else { flow.interval },
                typing: flow.typing,
                body: render(template, link),
            })
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[FlowStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Minimum wall-clock time to run the whole plan.
    pub fn min_duration(&self) -> Duration {
        self.steps
            .iter()
            .map(|s| s.delay_before + s.typing)
            .sum()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.body.clone()).collect()
    }
}

/// How a flow run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEnd {
    Completed,
    /// Sending step `step` failed; later steps were dropped.
    Failed { step: usize },
    /// Automation was switched off before step `step`.
    Cancelled { step: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowReport {
    pub sent: usize,
    pub end: FlowEnd,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(templates: &[&str]) -> FlowSettings {
        FlowSettings {
            interval: Duration::from_secs(5),
            typing: Duration::from_millis(1500),
            templates: templates.iter().map(|t| t.to_string()).collect(),
            ack_message: "ack".into(),
        }
    }

    #[test]
    fn link_from_host() {
        let settings = Settings::default();
        assert_eq!(
            booking_link(&settings, Some("escola.com.br")),
            "https://escola.com.br/marcar-aula"
        );
        assert_eq!(
            booking_link(&settings, Some("localhost:3000")),
            "http://localhost:3000/marcar-aula"
        );
        assert_eq!(booking_link(&settings, None), "http://localhost:3000/marcar-aula");
    }

    #[test]
    fn public_base_url_overrides_host() {
        let settings = Settings::from_pairs([("PUBLIC_BASE_URL", "https://leads.example.com/")]);
        assert_eq!(
            booking_link(&settings, Some("internal:8080")),
            "https://leads.example.com/marcar-aula"
        );
    }

    #[test]
    fn plan_layout() {
        let plan = FlowPlan::build(&flow(&["Oi", "Link: {LINK_AULA}", "Tchau {LINK_AULA}"]), "L");
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.steps()[0].delay_before, Duration::ZERO);
        assert_eq!(plan.steps()[1].delay_before, Duration::from_secs(5));
        assert_eq!(plan.bodies(), vec!["Oi", "Link: L", "Tchau L"]);
        assert_eq!(plan.steps()[2].kind(), "flow_step_3");
        // 2 intervals plus 3 typing pauses
        assert_eq!(plan.min_duration(), Duration::from_millis(14_500));
    }

    #[test]
    fn empty_plan() {
        let plan = FlowPlan::build(&flow(&[]), "L");
        assert!(plan.is_empty());
        assert_eq!(plan.min_duration(), Duration::ZERO);
    }
}
