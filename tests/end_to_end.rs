//! End-to-end scenarios against a fully wired [`Agent`], exercising the
//! request lifecycle the way a broker connection would: build a request
//! envelope, dispatch it, and inspect what the `Connector` received and what
//! landed in the spool directory.

use std::sync::{Arc, OnceLock};

use serde_json::{Value, json};
use tempfile::TempDir;

use pxa::agent::Agent;
use pxa::config::Configuration;
use pxa::connector::{ChannelConnector, Connector, SentMessage};

/// `bolt::run_detached` locates `pxa-execution-wrapper` as a sibling of
/// `std::env::current_exe()`, which is true for the installed `pxa-agent`
/// binary but not for this test binary (`cargo test` builds it under
/// `target/.../deps/`, while the `[[bin]]` targets land one directory up).
/// Copy the wrapper binary `cargo` already built into this test binary's own
/// directory once, so non-blocking dispatch can find it exactly as it would
/// next to the real agent.
fn colocate_execution_wrapper() {
    static DONE: OnceLock<()> = OnceLock::new();
    DONE.get_or_init(|| {
        let wrapper = std::path::PathBuf::from(env!("CARGO_BIN_EXE_pxa-execution-wrapper"));
        let here = std::env::current_exe().unwrap();
        let dest = here.parent().unwrap().join("pxa-execution-wrapper");
        if !dest.exists() {
            std::fs::copy(&wrapper, &dest).unwrap();
        }
    });
}

struct Fixture {
    _spool: TempDir,
    _cache: TempDir,
    _modules: TempDir,
    _modules_config: TempDir,
    _tasks: TempDir,
    config: Configuration,
}

impl Fixture {
    fn build() -> Self {
        let spool = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let modules = TempDir::new().unwrap();
        let modules_config = TempDir::new().unwrap();
        let tasks = TempDir::new().unwrap();
        let config = Configuration {
            spool_dir: spool.path().display().to_string(),
            spool_dir_purge_ttl: "14d".to_owned(),
            modules_dir: modules.path().display().to_string(),
            tasks_dir: tasks.path().display().to_string(),
            libexec_dir: "/opt/puppetlabs/pxa/libexec".to_owned(),
            modules_config_dir: modules_config.path().display().to_string(),
            cache_dir: cache.path().display().to_string(),
            cache_dir_purge_ttl: "14d".to_owned(),
            master_uris: vec![],
            ca: None,
            crt: None,
            key: None,
            crl: None,
            proxy: None,
            download_connect_timeout: 10,
            download_timeout: 300,
            ping_interval_s: 60,
        };
        Self { _spool: spool, _cache: cache, _modules: modules, _modules_config: modules_config, _tasks: tasks, config }
    }

    fn write_external_module(&self, name: &str, script: &str) {
        let path = std::path::Path::new(&self.config.modules_dir).join(name);
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn spool_path(&self, transaction_id: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.config.spool_dir).join(transaction_id)
    }
}

/// Scenario 1: echo blocking.
#[tokio::test]
async fn echo_blocking_returns_the_argument_as_outcome() {
    let fixture = Fixture::build();
    let connector = Arc::new(ChannelConnector::new());
    let agent = Agent::new(&fixture.config, Arc::clone(&connector) as Arc<dyn Connector>).await.unwrap();

    let data = json!({"transaction_id": "t1", "module": "echo", "action": "echo", "params": {"argument": "maradona"}});
    agent.handle_blocking_request("m1".into(), "client".into(), &data, vec![]).await;

    let sent = connector.sent().await;
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SentMessage::Blocking(_, metadata) => {
            assert_eq!(metadata.get("results"), Some(&json!({"outcome": "maradona"})));
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

/// Scenario 2: ping blocking, with and without a debug chunk.
#[tokio::test]
async fn ping_blocking_reports_hops_from_the_debug_chunk() {
    let fixture = Fixture::build();
    let connector = Arc::new(ChannelConnector::new());
    let agent = Agent::new(&fixture.config, Arc::clone(&connector) as Arc<dyn Connector>).await.unwrap();

    let data = json!({"transaction_id": "t1", "module": "ping", "action": "ping"});
    let debug = vec![json!({"hops": [
        {"server": "A", "time": "001", "stage": "accepted"},
        {"server": "A", "time": "007", "stage": "deliver"},
    ]})];
    agent.handle_blocking_request("m1".into(), "client".into(), &data, debug).await;

    let sent = connector.sent().await;
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SentMessage::Blocking(_, metadata) => {
            let hops = metadata.get("results").unwrap().get("request_hops").unwrap().as_array().unwrap();
            assert_eq!(hops.len(), 2);
            assert_eq!(hops[0].get("server"), Some(&Value::String("A".into())));
            assert_eq!(hops[1].get("stage"), Some(&Value::String("deliver".into())));
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn ping_blocking_without_debug_chunk_is_a_pxp_error() {
    let fixture = Fixture::build();
    let connector = Arc::new(ChannelConnector::new());
    let agent = Agent::new(&fixture.config, Arc::clone(&connector) as Arc<dyn Connector>).await.unwrap();

    let data = json!({"transaction_id": "t1", "module": "ping", "action": "ping"});
    agent.handle_blocking_request("m1".into(), "client".into(), &data, vec![]).await;

    let sent = connector.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], SentMessage::PxpError(_, tx, desc) if tx == "t1" && desc == "no debug entry"));
}

/// Scenario 3: an external module, run non-blocking, transitions the spool
/// directory from `Running` to `Success` and reports its output verbatim.
#[tokio::test]
async fn external_module_non_blocking_happy_path() {
    colocate_execution_wrapper();
    let fixture = Fixture::build();
    fixture.write_external_module(
        "echoer",
        "#!/bin/sh\n\
         if [ \"$1\" = metadata ]; then\n\
         \x20 echo '{\"description\":\"echoer\",\"actions\":[{\"name\":\"run\",\"description\":\"\",\"input\":{\"type\":\"object\"},\"results\":{\"type\":\"object\"}}]}'\n\
         else\n\
         \x20 cat >/dev/null\n\
         \x20 echo '{\"message\":\"hi\"}'\n\
         fi\n",
    );

    let connector = Arc::new(ChannelConnector::new());
    let agent = Agent::new(&fixture.config, Arc::clone(&connector) as Arc<dyn Connector>).await.unwrap();
    assert!(agent.processor().has_module("echoer"));

    let data = json!({
        "transaction_id": "ext-1",
        "module": "echoer",
        "action": "run",
        "params": {"input": {"message": "hi"}},
        "notify_outcome": true,
    });
    agent.handle_non_blocking_request("m1".into(), "client".into(), &data, vec![]).await;

    let mut sent = connector.sent().await;
    for _ in 0..200 {
        if sent.len() >= 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sent = connector.sent().await;
    }
    assert_eq!(sent.len(), 2, "expected a Provisional and a NonBlocking response");

    let exitcode = std::fs::read_to_string(fixture.spool_path("ext-1").join("exitcode")).unwrap();
    assert_eq!(exitcode.trim(), "0");

    assert!(matches!(&sent[0], SentMessage::Provisional(_, tx) if tx == "ext-1"));
    match sent.iter().find(|m| matches!(m, SentMessage::NonBlocking(..))).unwrap() {
        SentMessage::NonBlocking(_, job_id, metadata) => {
            assert_eq!(job_id, "ext-1");
            assert_eq!(metadata.get("status"), Some(&Value::String("success".into())));
            assert_eq!(metadata.get("results"), Some(&json!({"message": "hi"})));
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

/// Scenario 5: a status query against an id that never entered the spool
/// directory reports Unknown rather than an error.
#[tokio::test]
async fn status_query_on_unknown_transaction_id() {
    let fixture = Fixture::build();
    let connector = Arc::new(ChannelConnector::new());
    let agent = Agent::new(&fixture.config, Arc::clone(&connector) as Arc<dyn Connector>).await.unwrap();

    let data = json!({
        "transaction_id": "status-query",
        "module": "status",
        "action": "query",
        "params": {"transaction_id": "never-submitted"},
    });
    agent.handle_blocking_request("m1".into(), "client".into(), &data, vec![]).await;

    let sent = connector.sent().await;
    match &sent[0] {
        SentMessage::Blocking(_, metadata) => {
            let results = metadata.get("results").unwrap();
            assert_eq!(results.get("status"), Some(&Value::String("unknown".into())));
            assert_eq!(results.get("transaction_id"), Some(&Value::String("never-submitted".into())));
        }
        other => panic!("unexpected message: {other:?}"),
    }
}
