//! Argument sets for spawned peas and pods.
//!
//! A pea is one worker process; a pod is a group of peas. With `parallel > 1`
//! a pod becomes `head → peas → tail`, wired together by freshly assigned
//! local ports.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing::debug;

use flowgate_types::request::{ParsedPodSpawnRequest, PeaSpawnRequest};

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(
    name = "pea",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct PeaArgs {
    #[arg(long, default_value = "pea")]
    pub name: String,
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, default_value = "localhost")]
    pub host_in: String,
    #[arg(long, default_value = "localhost")]
    pub host_out: String,
    #[arg(long)]
    pub port_in: Option<u16>,
    #[arg(long)]
    pub port_out: Option<u16>,
    #[arg(long)]
    pub port_ctrl: Option<u16>,
    /// Executor the pea runs.
    #[arg(long, default_value = "_pass")]
    pub uses: String,
    #[arg(long, default_value_t = 0)]
    pub pea_id: u32,
    #[arg(long)]
    pub identity: Option<String>,
    /// Whether this pea may itself accept remote spawn requests.
    #[arg(long)]
    pub allow_spawn: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(
    name = "pod",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct PodArgs {
    #[arg(long, default_value = "pod")]
    pub name: String,
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long)]
    pub port_in: Option<u16>,
    #[arg(long)]
    pub port_out: Option<u16>,
    #[arg(long, default_value = "_pass")]
    pub uses: String,
    #[arg(long, default_value_t = 1)]
    pub parallel: u32,
    #[arg(long)]
    pub allow_spawn: bool,
}

impl PeaArgs {
    pub fn parse_args(args: &[String]) -> Result<Self> {
        Self::try_parse_from(known_flags::<Self>(args))
            .with_context(|| format!("Invalid pea arguments: {args:?}"))
    }

    /// Render back into an argument list that [`PeaArgs::parse_args`] accepts.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "--name".to_string(),
            self.name.clone(),
            "--host".to_string(),
            self.host.clone(),
            "--host-in".to_string(),
            self.host_in.clone(),
            "--host-out".to_string(),
            self.host_out.clone(),
            "--uses".to_string(),
            self.uses.clone(),
            "--pea-id".to_string(),
            self.pea_id.to_string(),
        ];
        for (flag, port) in [
            ("--port-in", self.port_in),
            ("--port-out", self.port_out),
            ("--port-ctrl", self.port_ctrl),
        ] {
            if let Some(port) = port {
                args.push(flag.to_string());
                args.push(port.to_string());
            }
        }
        if let Some(identity) = &self.identity {
            args.push("--identity".to_string());
            args.push(identity.clone());
        }
        if self.allow_spawn {
            args.push("--allow-spawn".to_string());
        }
        args
    }

    /// Take away the right to accept remote spawn requests.
    pub fn deny_remote_spawn(&mut self) {
        self.allow_spawn = false;
    }

    fn to_spawn_request(&self) -> PeaSpawnRequest {
        PeaSpawnRequest {
            args: self.to_cli_args(),
        }
    }
}

impl PodArgs {
    pub fn parse_args(args: &[String]) -> Result<Self> {
        Self::try_parse_from(known_flags::<Self>(args))
            .with_context(|| format!("Invalid pod arguments: {args:?}"))
    }
}

/// Keep only the flags `P` declares, with their values. Spawn requests may
/// carry flags meant for other parts of the system; those are skipped along
/// with a value that directly follows them.
fn known_flags<P: CommandFactory>(args: &[String]) -> Vec<String> {
    let command = P::command();
    let mut kept = Vec::with_capacity(args.len());
    let mut tokens = args.iter().peekable();
    while let Some(token) = tokens.next() {
        let Some(flag) = token.strip_prefix("--") else {
            debug!("Ignoring stray argument {token:?}");
            continue;
        };
        let (name, inline_value) = match flag.split_once('=') {
            Some((name, _)) => (name, true),
            None => (flag, false),
        };
        match command.get_arguments().find(|arg| arg.get_long() == Some(name)) {
            Some(arg) => {
                kept.push(token.clone());
                if arg.get_action().takes_values() && !inline_value {
                    if let Some(value) = tokens.next() {
                        kept.push(value.clone());
                    }
                }
            }
            None => {
                let skipped = if inline_value {
                    None
                } else {
                    tokens.next_if(|next| !next.starts_with('-'))
                };
                debug!("Ignoring unknown flag {token:?} (value {skipped:?})");
            }
        }
    }
    kept
}

/// The concrete per-process arguments of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodPeas {
    pub head: Option<PeaArgs>,
    pub tail: Option<PeaArgs>,
    pub peas: Vec<PeaArgs>,
}

impl PodPeas {
    /// Expand pod arguments into concrete peas, assigning free ports where
    /// the pod leaves them open.
    pub fn from_pod(pod: &PodArgs) -> Result<Self> {
        let port_in = port_or_random(pod.port_in)?;
        let port_out = port_or_random(pod.port_out)?;

        if pod.parallel <= 1 {
            let mut pea = pea_template(pod, &pod.name, 0);
            pea.port_in = Some(port_in);
            pea.port_out = Some(port_out);
            return Ok(Self {
                head: None,
                tail: None,
                peas: vec![pea],
            });
        }

        let head_out = random_port()?;
        let tail_in = random_port()?;

        let mut head = pea_template(pod, &format!("{}-head", pod.name), 0);
        head.uses = "_pass".to_string();
        head.port_in = Some(port_in);
        head.port_out = Some(head_out);

        let mut tail = pea_template(pod, &format!("{}-tail", pod.name), 0);
        tail.uses = "_pass".to_string();
        tail.port_in = Some(tail_in);
        tail.port_out = Some(port_out);

        let peas = (0..pod.parallel)
            .map(|i| {
                let mut pea = pea_template(pod, &format!("{}-{}", pod.name, i), i);
                pea.port_in = Some(head_out);
                pea.port_out = Some(tail_in);
                pea
            })
            .collect();

        Ok(Self {
            head: Some(head),
            tail: Some(tail),
            peas,
        })
    }

    pub fn from_parsed_request(req: &ParsedPodSpawnRequest) -> Result<Self> {
        let parse = |p: &PeaSpawnRequest| PeaArgs::parse_args(&p.args);
        Ok(Self {
            head: req.head.as_ref().map(parse).transpose()?,
            tail: req.tail.as_ref().map(parse).transpose()?,
            peas: req.peas.iter().map(parse).collect::<Result<_>>()?,
        })
    }

    pub fn to_parsed_request(&self) -> ParsedPodSpawnRequest {
        ParsedPodSpawnRequest {
            head: self.head.as_ref().map(PeaArgs::to_spawn_request),
            tail: self.tail.as_ref().map(PeaArgs::to_spawn_request),
            peas: self.peas.iter().map(PeaArgs::to_spawn_request).collect(),
        }
    }

    /// Head first, then the peas, then the tail.
    pub fn iter(&self) -> impl Iterator<Item = &PeaArgs> {
        self.head
            .iter()
            .chain(self.peas.iter())
            .chain(self.tail.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeaArgs> {
        self.head
            .iter_mut()
            .chain(self.peas.iter_mut())
            .chain(self.tail.iter_mut())
    }

    pub fn deny_remote_spawn(&mut self) {
        self.iter_mut().for_each(PeaArgs::deny_remote_spawn);
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn pea_template(pod: &PodArgs, name: &str, pea_id: u32) -> PeaArgs {
    PeaArgs {
        name: name.to_string(),
        host: pod.host.clone(),
        host_in: "localhost".to_string(),
        host_out: "localhost".to_string(),
        port_in: None,
        port_out: None,
        port_ctrl: None,
        uses: pod.uses.clone(),
        pea_id,
        identity: None,
        allow_spawn: pod.allow_spawn,
    }
}

fn port_or_random(port: Option<u16>) -> Result<u16> {
    match port {
        Some(port) => Ok(port),
        None => random_port(),
    }
}

/// Ask the OS for a currently free local port.
pub fn random_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .context("Failed to reserve a local port")?;
    Ok(listener.local_addr()?.port())
}
