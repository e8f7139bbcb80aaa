use serde::{Deserialize, Serialize};
use serde_json::json;

/// The executor's end of the status queue.
pub type StatusSink = tokio::sync::mpsc::UnboundedSender<StatusMessage>;

/// Everything the executor tells the outside world, in emission order:
/// `Start`, then `ValidationOk`, then one `StageInit` per stage entered,
/// then exactly one `Shutdown`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StatusMessage {
    Start,
    ValidationOk,
    StageInit { stage: usize },
    Shutdown(ShutdownReason),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ShutdownReason {
    Complete,
    ValidationError { message: String },
    ProcessError { message: String },
    Safety { variable: String, value: f64 },
}

impl StatusMessage {
    /// The JSON wire shape: bare strings for the unary messages, arrays
    /// for the parameterized ones.
    pub fn wire(&self) -> serde_json::Value {
        match self {
            StatusMessage::Start => json!("START"),
            StatusMessage::ValidationOk => json!("VALIDATION OK"),
            StatusMessage::StageInit { stage } => json!(["STAGE INIT", stage]),
            StatusMessage::Shutdown(reason) => match reason {
                ShutdownReason::Complete => json!(["SHUTDOWN", "COMPLETE"]),
                ShutdownReason::ValidationError { message } => {
                    json!(["SHUTDOWN", "VALIDATION ERROR", message])
                }
                ShutdownReason::ProcessError { message } => {
                    json!(["SHUTDOWN", "PROCESS ERROR", message])
                }
                ShutdownReason::Safety { variable, value } => {
                    json!(["SHUTDOWN", "SAFETY", variable, value])
                }
            },
        }
    }
}

impl std::fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire())
    }
}
