use std::{fs, sync::Arc};

use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::core::v1::Service;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use svcalloc_registry::{
    alloc::Allocators,
    config::{Config, FeatureGate},
    error::Error,
    metrics::Metrics,
    rest::REST,
    service::DEFAULT_NAMESPACE,
    storage::{CreateOptions, DeleteOptions, MemoryStore, UpdateOptions},
};
use svcalloc_trace::{
    error::TraceableError,
    init::{prepare_tracing, TraceConfig},
};

#[derive(Debug, Clone, Parser)]
pub struct ReplayCmd {
    #[arg(short = 'f', long, help = "YAML file holding the list of requests")]
    pub file: String,

    #[arg(short = 'c', long, help = "Config file path for the registry")]
    pub config: Option<String>,

    #[arg(long = "dual-stack", help = "Override the dual-stack feature gate")]
    pub dual_stack: Option<bool>,

    #[arg(long, help = "Print metrics in the Prometheus text format when done")]
    pub metrics: bool,
}

/// One entry of a replay file, tagged by `op`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    Create {
        service: Service,
        #[serde(default)]
        dry_run: bool,
    },
    Update {
        service: Service,
        #[serde(default)]
        dry_run: bool,
        #[serde(default)]
        force_allow_create: bool,
    },
    Delete {
        namespace: Option<String>,
        name: String,
        #[serde(default)]
        dry_run: bool,
    },
    Get {
        namespace: Option<String>,
        name: String,
    },
    List {
        namespace: Option<String>,
    },
    SetDualStack {
        enabled: bool,
    },
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Create { .. } => "create",
            Request::Update { .. } => "update",
            Request::Delete { .. } => "delete",
            Request::Get { .. } => "get",
            Request::List { .. } => "list",
            Request::SetDualStack { .. } => "setDualStack",
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<Service>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

/// Printed as one JSON line per request.
#[derive(Debug, Clone, Serialize)]
pub struct Line {
    pub index: usize,
    pub op: String,
    #[serde(flatten)]
    pub response: Response,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub fn start(config: Config, cmd: ReplayCmd, trace: TraceConfig) -> anyhow::Result<()> {
    prepare_tracing(trace)?;

    let contents =
        fs::read_to_string(&cmd.file).with_context(|| format!("failed to read {}", cmd.file))?;
    let requests: Vec<Request> = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse requests in {}", cmd.file))?;

    let registry = Registry::new();
    let metrics = Metrics::new()?.register(&registry)?;
    let rest = REST::new(
        MemoryStore::default(),
        Arc::new(Allocators::new(&config)?),
        Arc::new(FeatureGate::from(&config)),
        metrics,
    );

    let lines = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(replay(&rest, requests));
    for line in lines.iter() {
        println!("{}", serde_json::to_string(line)?);
    }

    if cmd.metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        print!("{}", String::from_utf8(buffer)?);
    }
    Ok(())
}

/// Runs the requests in order. A failed request does not stop the replay.
#[tracing::instrument(skip_all)]
pub async fn replay(rest: &REST<MemoryStore>, requests: Vec<Request>) -> Vec<Line> {
    let mut lines = Vec::with_capacity(requests.len());
    for (index, request) in requests.into_iter().enumerate() {
        let op = request.op().to_string();
        let line = match handle(rest, request).await {
            Ok(response) => Line {
                index,
                op,
                response,
                error: None,
                reason: None,
            },
            Err(e) => Line {
                index,
                op,
                response: Response::default(),
                error: Some(e.to_string()),
                reason: Some(e.metric_label()),
            },
        };
        lines.push(line);
    }
    tracing::info!(requests = lines.len(), "replayed requests");
    lines
}

async fn handle(rest: &REST<MemoryStore>, request: Request) -> Result<Response, Error> {
    match request {
        Request::Create { service, dry_run } => {
            let opts = if dry_run {
                CreateOptions::dry_run()
            } else {
                CreateOptions::default()
            };
            let svc = rest.create(service, &opts).await?;
            Ok(Response {
                service: Some(svc),
                ..Default::default()
            })
        }
        Request::Update {
            service,
            dry_run,
            force_allow_create,
        } => {
            let opts = if dry_run {
                UpdateOptions::dry_run()
            } else {
                UpdateOptions::default()
            };
            let (svc, created) = rest.update(service, force_allow_create, &opts).await?;
            Ok(Response {
                service: Some(svc),
                created: Some(created),
                ..Default::default()
            })
        }
        Request::Delete {
            namespace,
            name,
            dry_run,
        } => {
            let opts = if dry_run {
                DeleteOptions::dry_run()
            } else {
                DeleteOptions::default()
            };
            let namespace = namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
            let (svc, deleted) = rest.delete(&namespace, &name, &opts).await?;
            Ok(Response {
                service: Some(svc),
                deleted: Some(deleted),
                ..Default::default()
            })
        }
        Request::Get { namespace, name } => {
            let namespace = namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
            let svc = rest.get(&namespace, &name).await?;
            Ok(Response {
                service: Some(svc),
                ..Default::default()
            })
        }
        Request::List { namespace } => {
            let services = rest.list(namespace.as_deref()).await?;
            Ok(Response {
                services: Some(services),
                ..Default::default()
            })
        }
        Request::SetDualStack { enabled } => {
            rest.features().set_dual_stack(enabled);
            tracing::info!(enabled, "set dual-stack feature gate");
            Ok(Response::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svcalloc_registry::{
        fixture::test_rest,
        service::{cluster_ips, health_check_node_port},
    };

    const REQUESTS: &str = include_str!("../testdata/requests.yaml");

    #[test]
    fn works_parse_requests() {
        let requests: Vec<Request> = serde_yaml::from_str(REQUESTS).unwrap();
        let ops = requests.iter().map(|r| r.op()).collect::<Vec<&str>>();
        assert_eq!(
            ops,
            vec![
                "create",
                "create",
                "create",
                "update",
                "get",
                "setDualStack",
                "create",
                "delete",
                "list",
                "create"
            ]
        );
        match &requests[1] {
            Request::Create { dry_run, .. } => assert!(*dry_run),
            _ => panic!("this test should be failed"),
        }
    }

    #[test]
    fn fails_parse_unknown_op() {
        let res = serde_yaml::from_str::<Vec<Request>>("- op: patch\n  name: a\n");
        if res.is_ok() {
            panic!("this test should be failed")
        }
    }

    #[tokio::test]
    async fn works_replay() {
        let rest = test_rest(&["10.0.0.0/24", "fd00::/120"], true);
        let requests: Vec<Request> = serde_yaml::from_str(REQUESTS).unwrap();
        let lines = replay(&rest, requests).await;
        assert_eq!(lines.len(), 10);

        // dual-stack web service
        let web = lines[0].response.service.as_ref().unwrap();
        assert_eq!(cluster_ips(web).len(), 2);

        assert!(lines[1].error.is_none());
        assert!(lines[1].response.service.is_some());

        let lb = lines[2].response.service.as_ref().unwrap();
        assert_ne!(health_check_node_port(lb), 0);

        // switching to Cluster drops the health check node port
        let lb = lines[3].response.service.as_ref().unwrap();
        assert_eq!(health_check_node_port(lb), 0);
        assert_eq!(lines[3].response.created, Some(false));

        assert!(lines[4].response.service.is_some());
        assert!(lines[5].error.is_none());

        // dual-stack is off now
        let single = lines[6].response.service.as_ref().unwrap();
        assert_eq!(cluster_ips(single).len(), 1);

        assert_eq!(lines[7].response.deleted, Some(true));
        assert_eq!(lines[8].response.services.as_ref().unwrap().len(), 2);

        // outside of the service range
        assert_eq!(lines[9].reason.as_deref(), Some("invalid"));
        assert!(lines[9].response.service.is_none());

        let json = serde_json::to_value(&lines[7]).unwrap();
        assert_eq!(json["op"], "delete");
        assert_eq!(json["deleted"], true);
        assert!(json.get("error").is_none());
    }
}
