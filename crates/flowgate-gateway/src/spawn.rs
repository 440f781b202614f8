//! Starts peas and pods on behalf of remote callers and
//! streams their log output back.
//!
//! Spawned processes never get remote-spawn rights of their own: every pea
//! argument set is forced to `allow_spawn = false` before launch.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_stream::try_stream;
use futures::Stream;
use tracing::{debug, info, warn};

use flowgate_types::request::{Request, RequestBody, SpawnBody, SpawnRequest, SpawnStatus};

use crate::args::{PeaArgs, PodArgs, PodPeas};
use crate::error::GatewayError;
use crate::registry::{ProcessRegistry, Registration};
use crate::runtime::{Launcher, PeaPod};

#[derive(Clone)]
pub struct Spawner {
    allow_spawn: bool,
    address: String,
    registry: ProcessRegistry,
    launcher: Arc<dyn Launcher>,
}

/// What a spawn request resolved to, before anything is started.
#[derive(Debug)]
enum SpawnPlan {
    Pea(PeaArgs),
    Pod { name: String, peas: PodPeas },
}

impl SpawnPlan {
    fn start(self, launcher: &dyn Launcher) -> Result<PeaPod> {
        match self {
            Self::Pea(args) => PeaPod::start_pea(args, launcher),
            Self::Pod { name, peas } => PeaPod::start_pod(name, peas, launcher),
        }
    }
}

impl Spawner {
    /// `address` is this gateway's `host:port`, quoted back to callers when
    /// spawning is disabled.
    pub fn new(
        allow_spawn: bool,
        address: impl Into<String>,
        registry: ProcessRegistry,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            allow_spawn,
            address: address.into(),
            registry,
            launcher,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Serve one spawn call.
    ///
    /// Yields one response per log line the spawned processes write, each a
    /// copy of the request with `log_record` set. When spawning is disabled
    /// it yields a single denial instead.
    pub fn spawn(&self, request: Request) -> impl Stream<Item = Result<Request>> + Send + 'static {
        let spawner = self.clone();
        try_stream! {
            if !spawner.allow_spawn {
                yield spawner.denied(request);
            } else {
                let (plan, template) = classify(request)?;

                let handle = Arc::new(plan.start(spawner.launcher.as_ref())?);
                let mut logs = handle
                    .take_logs()
                    .context("Log stream of a fresh handle was already taken")?;
                let registration = Registration::new(&spawner.registry, handle.clone());

                while let Some(record) = logs.recv().await {
                    debug!("[{}] {}", record.source, record.msg);
                    yield with_log_record(&template, record.msg);
                }
                drop(registration);
            }
        }
    }

    fn denied(&self, mut request: Request) -> Request {
        let warn_msg = format!(
            "the gateway at {} does not support remote spawn, please restart it with --allow-spawn",
            self.address
        );
        warn!("{warn_msg}");
        if !matches!(request.body, RequestBody::Spawn(_)) {
            request.body = RequestBody::Spawn(SpawnRequest {
                body: None,
                log_record: None,
                status: SpawnStatus::Success,
            });
        }
        if let RequestBody::Spawn(spawn) = &mut request.body {
            spawn.log_record = Some(warn_msg);
            spawn.status = SpawnStatus::ErrorNotAllowed;
        }
        request
    }
}

/// Pick the process topology for a request, with remote spawn denied for
/// every pea. Also returns the template every log response is built from;
/// for a pod that is the concrete parsed pod so the caller learns the
/// assigned ports.
fn classify(request: Request) -> Result<(SpawnPlan, Request)> {
    let spawn = match &request.body {
        RequestBody::Spawn(spawn) => spawn,
        other => return Err(GatewayError::BadRequestType(format!("{} request", other.kind())).into()),
    };

    match &spawn.body {
        Some(SpawnBody::Pea(req)) => {
            let mut args = PeaArgs::parse_args(&req.args)?;
            args.deny_remote_spawn();
            info!("starting a pea from a remote request");
            Ok((SpawnPlan::Pea(args), request))
        }
        Some(SpawnBody::Pod(req)) => {
            let pod = PodArgs::parse_args(&req.args)?;
            let mut peas = PodPeas::from_pod(&pod)?;
            peas.deny_remote_spawn();
            info!("starting a pod from a remote request");

            let template = Request {
                request_id: request.request_id.clone(),
                body: RequestBody::Spawn(SpawnRequest::new(SpawnBody::ParsedPod(
                    peas.to_parsed_request(),
                ))),
            };
            Ok((SpawnPlan::Pod { name: pod.name, peas }, template))
        }
        Some(SpawnBody::ParsedPod(req)) => {
            let mut peas = PodPeas::from_parsed_request(req)?;
            peas.deny_remote_spawn();
            let name = peas
                .iter()
                .next()
                .map(|p| p.name.clone())
                .ok_or_else(|| GatewayError::BadRequestType("parsed pod without peas".into()))?;
            info!("starting a parsed pod from a remote request");
            Ok((SpawnPlan::Pod { name, peas }, request))
        }
        None => Err(GatewayError::BadRequestType("spawn request without a body".into()).into()),
    }
}

fn with_log_record(template: &Request, msg: String) -> Request {
    let mut response = template.clone();
    if let RequestBody::Spawn(spawn) = &mut response.body {
        spawn.log_record = Some(msg);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures::StreamExt;
    use tokio::process::Command;

    use flowgate_types::request::{
        DataRequest, ParsedPodSpawnRequest, PeaSpawnRequest, PodSpawnRequest,
    };

    use crate::runtime::tests::ShellLauncher;

    /// Records the arguments of every pea it launches.
    struct RecordingLauncher {
        inner: ShellLauncher,
        launched: Mutex<Vec<PeaArgs>>,
    }

    impl RecordingLauncher {
        fn new(script: &str) -> Arc<Self> {
            Arc::new(Self {
                inner: ShellLauncher(script.to_string()),
                launched: Mutex::new(Vec::new()),
            })
        }
    }

    impl Launcher for RecordingLauncher {
        fn command(&self, args: &PeaArgs) -> Command {
            self.launched.lock().unwrap().push(args.clone());
            self.inner.command(args)
        }
    }

    fn spawner(allow: bool, launcher: Arc<RecordingLauncher>) -> Spawner {
        Spawner::new(allow, "10.0.0.1:55555", ProcessRegistry::new(), launcher)
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn pea_request(args: &[&str]) -> Request {
        Request::spawn(SpawnBody::Pea(PeaSpawnRequest { args: strings(args) }))
    }

    fn log_of(resp: &Request) -> &str {
        resp.as_spawn().unwrap().log_record.as_deref().unwrap()
    }

    #[tokio::test]
    async fn disabled_spawn_yields_one_denial() {
        let launcher = RecordingLauncher::new("echo should not run");
        let spawner = spawner(false, launcher.clone());

        let out: Vec<_> = spawner.spawn(pea_request(&[])).collect().await;
        assert_eq!(out.len(), 1);
        let resp = out.into_iter().next().unwrap().unwrap();
        let spawn = resp.as_spawn().unwrap();
        assert_eq!(spawn.status, SpawnStatus::ErrorNotAllowed);
        assert!(spawn.log_record.as_deref().unwrap().contains("10.0.0.1:55555"));
        assert!(launcher.launched.lock().unwrap().is_empty());
        assert!(spawner.registry().is_empty());
    }

    #[tokio::test]
    async fn denial_applies_to_non_spawn_requests_too() {
        let spawner = spawner(false, RecordingLauncher::new("true"));
        let req = Request::new(RequestBody::Index(DataRequest::default()));
        let out: Vec<_> = spawner.spawn(req).collect().await;
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].as_ref().unwrap().as_spawn().unwrap().status,
            SpawnStatus::ErrorNotAllowed
        );
    }

    #[tokio::test]
    async fn pea_spawn_streams_logs_in_order() {
        let spawner = spawner(true, RecordingLauncher::new("echo booting {name}; echo ready"));
        let req = pea_request(&["--name", "enc"]).with_id("spawn-1");

        let out: Vec<_> = spawner
            .spawn(req)
            .map(|r| r.unwrap())
            .collect()
            .await;
        let logs: Vec<_> = out.iter().map(log_of).collect();
        assert_eq!(logs, vec!["booting enc", "ready"]);
        assert!(out.iter().all(|r| r.request_id == "spawn-1"));
        assert!(out
            .iter()
            .all(|r| r.as_spawn().unwrap().status == SpawnStatus::Success));
        assert!(spawner.registry().is_empty());
    }

    #[tokio::test]
    async fn pod_is_registered_while_logging() {
        let spawner = spawner(true, RecordingLauncher::new("echo {name} up"));
        let req = Request::spawn(SpawnBody::Pod(PodSpawnRequest {
            args: strings(&["--name", "idx", "--parallel", "2"]),
        }));

        let mut stream = Box::pin(spawner.spawn(req));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(spawner.registry().len(), 1);

        match &first.as_spawn().unwrap().body {
            Some(SpawnBody::ParsedPod(parsed)) => {
                assert!(parsed.head.is_some());
                assert!(parsed.tail.is_some());
                assert_eq!(parsed.peas.len(), 2);
            }
            other => panic!("expected parsed pod, got {other:?}"),
        }

        let mut count = 1;
        while let Some(resp) = stream.next().await {
            resp.unwrap();
            count += 1;
        }
        assert_eq!(count, 4);
        assert!(spawner.registry().is_empty());
    }

    #[tokio::test]
    async fn parsed_pod_is_started_as_given() {
        let launcher = RecordingLauncher::new("echo {name}");
        let spawner = spawner(true, launcher.clone());
        let req = Request::spawn(SpawnBody::ParsedPod(ParsedPodSpawnRequest {
            head: None,
            tail: None,
            peas: vec![
                PeaSpawnRequest { args: strings(&["--name", "a", "--port-in", "7001"]) },
                PeaSpawnRequest { args: strings(&["--name", "b", "--port-in", "7002"]) },
            ],
        }));

        let mut logs: Vec<_> = spawner
            .spawn(req)
            .map(|r| log_of(&r.unwrap()).to_string())
            .collect()
            .await;
        logs.sort();
        assert_eq!(logs, vec!["a", "b"]);

        let launched = launcher.launched.lock().unwrap();
        assert_eq!(launched[0].port_in, Some(7001));
        assert_eq!(launched[1].port_in, Some(7002));
    }

    #[tokio::test]
    async fn spawned_peas_cannot_spawn_remotely() {
        let launcher = RecordingLauncher::new("true");
        let spawner = spawner(true, launcher.clone());

        let _: Vec<_> = spawner.spawn(pea_request(&["--allow-spawn"])).collect().await;
        let pod = Request::spawn(SpawnBody::Pod(PodSpawnRequest {
            args: strings(&["--parallel", "2", "--allow-spawn"]),
        }));
        let _: Vec<_> = spawner.spawn(pod).collect().await;

        let launched = launcher.launched.lock().unwrap();
        assert_eq!(launched.len(), 5);
        assert!(launched.iter().all(|p| !p.allow_spawn));
    }

    #[tokio::test]
    async fn unknown_variant_fails_the_call() {
        let spawner = spawner(true, RecordingLauncher::new("true"));

        let empty = Request::new(RequestBody::Spawn(SpawnRequest {
            body: None,
            log_record: None,
            status: SpawnStatus::Success,
        }));
        let out: Vec<_> = spawner.spawn(empty).collect().await;
        assert_eq!(out.len(), 1);
        let err = out.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::BadRequestType(_))
        ));

        let data = Request::new(RequestBody::Search(DataRequest::default()));
        let out: Vec<_> = spawner.spawn(data).collect().await;
        assert!(out[0].is_err());
    }

    #[tokio::test]
    async fn bad_call_does_not_disturb_a_concurrent_one() {
        let spawner = spawner(true, RecordingLauncher::new("echo a; sleep 0.2; echo b"));

        let good = spawner.spawn(pea_request(&["--name", "good"])).collect::<Vec<_>>();
        let bad = spawner
            .spawn(Request::new(RequestBody::Spawn(SpawnRequest {
                body: None,
                log_record: None,
                status: SpawnStatus::Success,
            })))
            .collect::<Vec<_>>();

        let (good, bad) = tokio::join!(good, bad);
        assert_eq!(bad.len(), 1);
        assert!(bad[0].is_err());
        let logs: Vec<_> = good.iter().map(|r| log_of(r.as_ref().unwrap())).collect();
        assert_eq!(logs, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn dropping_the_call_retires_the_process() {
        let spawner = spawner(true, RecordingLauncher::new("echo up; exec sleep 30"));
        let mut stream = Box::pin(spawner.spawn(pea_request(&["--name", "long"])));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(log_of(&first), "up");
        assert_eq!(spawner.registry().len(), 1);

        drop(stream);
        assert!(spawner.registry().is_empty());
    }

    #[tokio::test]
    async fn bad_arguments_fail_the_call() {
        let spawner = spawner(true, RecordingLauncher::new("true"));
        let out: Vec<_> = spawner
            .spawn(pea_request(&["--port-in", "nope"]))
            .collect()
            .await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
        assert!(spawner.registry().is_empty());
    }
}
