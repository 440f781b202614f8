use serde::{Deserialize, Serialize};

/// A client request. Carries no identity beyond its position in a stream;
/// `request_id` is an opaque client tag passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub request_id: String,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestBody {
    Index(DataRequest),
    Search(DataRequest),
    Train(DataRequest),
    Control(ControlRequest),
    Spawn(SpawnRequest),
}

/// Documents plus whatever the drivers attached on the way back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    #[serde(default)]
    pub docs: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub command: String,
}

/// The logical kind of a request body, used to pick a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Index,
    Search,
    Train,
    Control,
    Spawn,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index => write!(f, "index"),
            Self::Search => write!(f, "search"),
            Self::Train => write!(f, "train"),
            Self::Control => write!(f, "control"),
            Self::Spawn => write!(f, "spawn"),
        }
    }
}

impl std::str::FromStr for RequestKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index" => Ok(Self::Index),
            "search" => Ok(Self::Search),
            "train" => Ok(Self::Train),
            "control" => Ok(Self::Control),
            "spawn" => Ok(Self::Spawn),
            _ => Err(format!("unknown request kind: {s}")),
        }
    }
}

impl RequestBody {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Index(_) => RequestKind::Index,
            Self::Search(_) => RequestKind::Search,
            Self::Train(_) => RequestKind::Train,
            Self::Control(_) => RequestKind::Control,
            Self::Spawn(_) => RequestKind::Spawn,
        }
    }
}

impl Request {
    pub fn new(body: RequestBody) -> Self {
        Self {
            request_id: String::new(),
            body,
        }
    }

    pub fn with_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.body.kind()
    }

    /// Returns the spawn payload, if this is a spawn request.
    pub fn as_spawn(&self) -> Option<&SpawnRequest> {
        match &self.body {
            RequestBody::Spawn(spawn) => Some(spawn),
            _ => None,
        }
    }

    /// Builds a spawn request around the given variant.
    pub fn spawn(body: SpawnBody) -> Self {
        Self::new(RequestBody::Spawn(SpawnRequest::new(body)))
    }
}

// ─── Spawn requests ───────────────────────────────────────────────────────────

/// A request to start worker processes on the gateway's host.
///
/// Exactly one variant is expected in `body`; an absent body is a contract
/// error on the caller's side. `log_record` and `status` are filled in by the
/// gateway on the way back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    #[serde(default)]
    pub body: Option<SpawnBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_record: Option<String>,
    #[serde(default)]
    pub status: SpawnStatus,
}

impl SpawnRequest {
    pub fn new(body: SpawnBody) -> Self {
        Self {
            body: Some(body),
            log_record: None,
            status: SpawnStatus::Success,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum SpawnBody {
    Pea(PeaSpawnRequest),
    Pod(PodSpawnRequest),
    ParsedPod(ParsedPodSpawnRequest),
}

/// Argument list for a single process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeaSpawnRequest {
    #[serde(default)]
    pub args: Vec<String>,
}

/// Argument list for a process group, still to be expanded into peas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpawnRequest {
    #[serde(default)]
    pub args: Vec<String>,
}

/// A process group whose per-process arguments are already concrete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedPodSpawnRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<PeaSpawnRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<PeaSpawnRequest>,
    #[serde(default)]
    pub peas: Vec<PeaSpawnRequest>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnStatus {
    #[default]
    Success,
    ErrorNotAllowed,
}

impl std::fmt::Display for SpawnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::ErrorNotAllowed => write!(f, "error_not_allowed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in [
            RequestKind::Index,
            RequestKind::Search,
            RequestKind::Train,
            RequestKind::Control,
            RequestKind::Spawn,
        ] {
            let parsed: RequestKind = kind.to_string().parse().unwrap();
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn spawn_request_wire_shape() {
        let req = Request::spawn(SpawnBody::Pea(PeaSpawnRequest {
            args: vec!["--name".into(), "encoder".into()],
        }));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["body"]["kind"], "spawn");
        assert_eq!(json["body"]["body"]["variant"], "pea");
        assert_eq!(json["body"]["status"], "success");
        assert!(json["body"].get("log_record").is_none());
    }

    #[test]
    fn spawn_without_body_parses() {
        let json = r#"{"body":{"kind":"spawn"}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        let spawn = req.as_spawn().unwrap();
        assert!(spawn.body.is_none());
        assert_eq!(spawn.status, SpawnStatus::Success);
    }

    #[test]
    fn data_request_defaults() {
        let json = r#"{"request_id":"r1","body":{"kind":"search"}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(req.kind(), RequestKind::Search);
        assert_eq!(req.body, RequestBody::Search(DataRequest::default()));
    }
}
