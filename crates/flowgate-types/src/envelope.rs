use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::Request;

/// Routing metadata attached to a request while it travels on the fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Origin identity, e.g. `"gateway"`.
    pub sender_id: String,
    /// Fabric identity of the node that expects the reply.
    pub receiver_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// One hop a message went through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub pod: String,
    pub pod_id: String,
    pub start_time: DateTime<Utc>,
}

/// What actually goes over the fabric: a request plus its envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub envelope: Envelope,
    pub request: Request,
}

impl Message {
    /// Drops the envelope and hands back the bare request.
    pub fn into_request(self) -> Request {
        self.request
    }
}

/// Wraps `request` for the fabric, recording the sender as the first hop.
pub fn add_envelope(request: Request, sender: &str, identity: &str) -> Message {
    let envelope = Envelope {
        sender_id: sender.to_string(),
        receiver_id: identity.to_string(),
        request_id: request.request_id.clone(),
        routes: vec![Route {
            pod: sender.to_string(),
            pod_id: identity.to_string(),
            start_time: Utc::now(),
        }],
    };
    Message { envelope, request }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ControlRequest, RequestBody};

    #[test]
    fn envelope_records_sender_hop() {
        let req = Request::new(RequestBody::Control(ControlRequest {
            command: "status".into(),
        }))
        .with_id("c-1");
        let msg = add_envelope(req.clone(), "gateway", "ident-7");

        assert_eq!(msg.envelope.sender_id, "gateway");
        assert_eq!(msg.envelope.receiver_id, "ident-7");
        assert_eq!(msg.envelope.request_id, "c-1");
        assert_eq!(msg.envelope.routes.len(), 1);
        assert_eq!(msg.envelope.routes[0].pod, "gateway");
        assert_eq!(msg.into_request(), req);
    }
}
