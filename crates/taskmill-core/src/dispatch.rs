use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of execution back-ends. The serialized form is the executor
/// name a work queue routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutorKind {
    /// In-process restricted Python scope.
    #[serde(rename = "dynamic.execute_code")]
    SandboxedCode,
    /// Resource-limited container.
    #[serde(rename = "isolated.execute_code")]
    IsolatedCode,
    /// One outbound HTTP request.
    #[serde(rename = "api.execute_request")]
    HttpCall,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 3] = [
        ExecutorKind::SandboxedCode,
        ExecutorKind::IsolatedCode,
        ExecutorKind::HttpCall,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExecutorKind::SandboxedCode => "dynamic.execute_code",
            ExecutorKind::IsolatedCode => "isolated.execute_code",
            ExecutorKind::HttpCall => "api.execute_request",
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ExecutorKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown executor: {s}"))
    }
}

/// A named executor plus the keyword arguments it is invoked with.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub executor: ExecutorKind,
    pub kwargs: Map<String, Value>,
}

impl WorkItem {
    /// Task id the item reports its status against, if tagged.
    pub fn task_id(&self) -> Option<&str> {
        self.kwargs.get("task_id").and_then(Value::as_str)
    }

    pub fn task_name(&self) -> Option<&str> {
        self.kwargs.get("task_name").and_then(Value::as_str)
    }
}
