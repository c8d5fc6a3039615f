//! Deploys and supervises the per-container exporter agent.
//!
//! The runtime's exec primitive is the only channel into a container,
//! so the launcher script is materialized by echoing it line by line
//! through `/bin/sh -c`. The launcher `exec`s the real binary, which
//! makes the exec session's pid the agent's own pid; `stop` depends on
//! that to kill agents by pid later.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::docker::{self, ContainerRuntime, ExecOptions};
use crate::registry::{ContainerRecord, RegistryEvent, Subscription};

const REMOTE_BIN_DIR: &str = "/bin";
const LAUNCHER_PATH: &str = "/bin/kadvisor.sh";

/// The in-container process launched for one container. The pid is not
/// stored; it is resolved from the exec session when the agent has to
/// be terminated.
#[derive(Debug, Clone)]
struct ExecHandle {
    container_id: String,
    exec_id: String,
}

pub struct AgentManager {
    runtime: Arc<dyn ContainerRuntime>,
    agent_path: PathBuf,
    params: Vec<String>,
    exec_handles: DashMap<String, ExecHandle>,
}

impl AgentManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, agent_path: PathBuf, params: &str) -> Self {
        Self {
            runtime,
            agent_path,
            params: tokenize_params(params),
            exec_handles: DashMap::new(),
        }
    }

    /// Consumes a registry subscription: deploys into every already
    /// running container, then follows add/remove transitions until the
    /// registry goes away.
    pub fn run(self: Arc<Self>, mut subscription: Subscription) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            for record in std::mem::take(&mut subscription.initial) {
                self.added(&record).await;
            }
            while let Some(event) = subscription.events.recv().await {
                match event {
                    RegistryEvent::Added(record) => self.added(&record).await,
                    RegistryEvent::Removed(record) => self.removed(&record),
                }
            }
            log::debug!("agent manager event task stopped");
        })
    }

    /// Deploys and starts the agent in a newly watched container. On
    /// failure nothing is recorded; a later health transition retries
    /// the whole sequence.
    pub async fn added(&self, record: &ContainerRecord) {
        match self.deploy(&record.id).await {
            Ok(exec_id) => {
                log::info!(
                    "started agent {REMOTE_BIN_DIR}/{} in container `{}` (exec id {exec_id}) with {} params",
                    self.binary_name(),
                    record.id,
                    self.params.len()
                );
                self.exec_handles.insert(
                    record.id.clone(),
                    ExecHandle {
                        container_id: record.id.clone(),
                        exec_id,
                    },
                );
            }
            Err(err) => {
                log::error!(
                    "failed to deploy agent into container `{}`, not monitored: {err}",
                    record.id
                );
            }
        }
    }

    /// Drops the bookkeeping for a removed container. No signal is
    /// sent; the container itself is gone or dying.
    pub fn removed(&self, record: &ContainerRecord) {
        self.exec_handles.remove(&record.id);
    }

    async fn deploy(&self, container_id: &str) -> docker::Result<String> {
        self.runtime
            .copy_to_container(&self.agent_path, container_id, REMOTE_BIN_DIR)
            .await?;
        self.prepare_env(container_id).await?;

        let mut cmd = vec![LAUNCHER_PATH.to_owned()];
        cmd.extend(self.params.iter().cloned());
        let exec_id = self
            .runtime
            .exec_create(container_id, &cmd, ExecOptions::default())
            .await?;
        self.runtime.exec_start(&exec_id, true).await?;

        Ok(exec_id)
    }

    /// Writes the launcher script into the container and makes both it
    /// and the agent binary executable, all through one shell exec.
    async fn prepare_env(&self, container_id: &str) -> docker::Result<()> {
        let binary_name = self.binary_name();
        let mut command_lines = vec![
            "PATH=\"/bin:/usr/bin\"".to_owned(),
            format!("chmod 755 {REMOTE_BIN_DIR}/{binary_name}"),
        ];
        for (i, line) in launcher_script(&binary_name).lines().enumerate() {
            let redirect = if i == 0 { ">" } else { ">>" };
            command_lines.push(format!(
                "echo $'{}' {redirect} {LAUNCHER_PATH}",
                line.replace('\'', "\\'")
            ));
        }
        command_lines.push(format!("chmod 755 {LAUNCHER_PATH}"));

        let cmd = vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            command_lines.join(";"),
        ];
        let opts = ExecOptions {
            attach_stdin: true,
            attach_stderr: true,
            ..ExecOptions::default()
        };
        let exec_id = self.runtime.exec_create(container_id, &cmd, opts).await?;
        let output = self.runtime.exec_start(&exec_id, false).await?;
        log::debug!("wrote {LAUNCHER_PATH} in container `{container_id}`: {output}");

        Ok(())
    }

    /// Terminates every running agent by resolving the exec session's
    /// live pid and killing it inside the container. Each handle is
    /// torn down independently.
    pub async fn stop(&self) {
        let handles: Vec<ExecHandle> = self
            .exec_handles
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            if let Err(err) = self.kill_agent(&handle).await {
                log::error!(
                    "failed to terminate agent in container `{}`: {err}",
                    handle.container_id
                );
            }
        }
    }

    async fn kill_agent(&self, handle: &ExecHandle) -> docker::Result<()> {
        let exec_state = self.runtime.exec_inspect(&handle.exec_id).await?;
        let cmd = vec![
            "kill".to_owned(),
            "-9".to_owned(),
            exec_state.pid.to_string(),
        ];
        let opts = ExecOptions {
            attach_stdout: true,
            attach_stderr: true,
            ..ExecOptions::default()
        };
        let exec_id = self
            .runtime
            .exec_create(&exec_state.container_id, &cmd, opts)
            .await?;
        self.runtime.exec_start(&exec_id, false).await?;

        Ok(())
    }

    fn binary_name(&self) -> String {
        self.agent_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "agent".to_owned())
    }
}

/// The restart-safe launcher written into each container.
///
/// It first kills any stale process sharing the agent's binary name
/// (left over from a previous launch attempt), then `exec`s the real
/// binary so the shell process is replaced and the exec session's pid
/// is the agent's pid.
fn launcher_script(binary_name: &str) -> String {
    format!(
        "#!/bin/sh\n\
         PATH=\"/bin:/usr/bin\"\n\
         if [ -x \"$(command -v pkill)\" ]; then\n\
        \x20 pkill {binary_name}\n\
         elif [ -x \"$(command -v killall)\" ]; then\n\
        \x20 killall {binary_name}\n\
         fi\n\
         exec {REMOTE_BIN_DIR}/{binary_name} \"$@\"\n"
    )
}

/// Splits a raw parameter string into an argument list.
///
/// Tokens split on whitespace; a double-quoted run is one token and may
/// contain whitespace. Surrounding quotes are stripped.
pub fn tokenize_params(params: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = params.trim_start();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('"') {
            match after.find('"') {
                Some(end) => {
                    tokens.push(after[..end].to_owned());
                    rest = after[end + 1..].trim_start();
                }
                None => {
                    tokens.push(after.to_owned());
                    rest = "";
                }
            }
        } else {
            let end = rest
                .find(char::is_whitespace)
                .unwrap_or(rest.len());
            let token = &rest[..end];
            let token = token
                .strip_prefix('\'')
                .and_then(|t| t.strip_suffix('\''))
                .unwrap_or(token);
            tokens.push(token.to_owned());
            rest = rest[end..].trim_start();
        }
    }

    tokens
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::docker::{
        ContainerSummary, Error, Event, ExecInfo, Result, async_trait,
    };

    #[test]
    fn tokenizes_single_flag() {
        assert_eq!(tokenize_params("--no-collector.timex"), vec![
            "--no-collector.timex"
        ]);
    }

    #[test]
    fn tokenizes_single_quoted_flag_stripping_quotes() {
        assert_eq!(tokenize_params("'--no-collector.timex'"), vec![
            "--no-collector.timex"
        ]);
    }

    #[test]
    fn tokenizes_two_flags() {
        assert_eq!(
            tokenize_params("--no-collector.timex --no-collector.any"),
            vec!["--no-collector.timex", "--no-collector.any"]
        );
    }

    #[test]
    fn double_quoted_run_with_whitespace_is_one_token() {
        assert_eq!(tokenize_params("--no-collector.timex \"aa bb\""), vec![
            "--no-collector.timex",
            "aa bb"
        ]);
    }

    #[test]
    fn empty_params_yield_no_tokens() {
        assert!(tokenize_params("").is_empty());
        assert!(tokenize_params("   ").is_empty());
    }

    #[test]
    fn launcher_kills_stale_process_then_execs_binary() {
        let script = launcher_script("node_exporter");
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("pkill node_exporter"));
        assert!(script.contains("killall node_exporter"));
        assert!(script.ends_with("exec /bin/node_exporter \"$@\"\n"));
    }

    /// Records runtime calls and can be told to fail specific
    /// operations.
    #[derive(Default)]
    struct MockRuntime {
        calls: StdMutex<Vec<String>>,
        fail_copy: bool,
        fail_exec_inspect_for: Option<String>,
        pids: StdMutex<HashMap<String, i64>>,
    }

    impl MockRuntime {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn refused(path: &str) -> Error {
            Error::UnexpectedStatus {
                status: hyper::StatusCode::INTERNAL_SERVER_ERROR,
                path: path.to_owned(),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn list_containers(&self, _label: &str) -> Result<Vec<ContainerSummary>> {
            Ok(Vec::new())
        }

        async fn inspect_container(&self, id: &str) -> Result<crate::docker::ContainerInfo> {
            Err(Self::refused(&format!("/containers/{id}/json")))
        }

        async fn copy_to_container(&self, _: &Path, id: &str, dir: &str) -> Result<()> {
            self.record(format!("copy {id} {dir}"));
            if self.fail_copy {
                return Err(Self::refused("/archive"));
            }
            Ok(())
        }

        async fn exec_create(&self, id: &str, cmd: &[String], _: ExecOptions) -> Result<String> {
            self.record(format!("exec_create {id} {}", cmd.join(" ")));
            Ok(format!("exec-{id}-{}", self.calls.lock().unwrap().len()))
        }

        async fn exec_start(&self, exec_id: &str, detach: bool) -> Result<String> {
            self.record(format!("exec_start {exec_id} detach={detach}"));
            Ok(String::new())
        }

        async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInfo> {
            self.record(format!("exec_inspect {exec_id}"));
            if self
                .fail_exec_inspect_for
                .as_deref()
                .is_some_and(|failing| exec_id.contains(failing))
            {
                return Err(Self::refused("/exec/json"));
            }
            let pid = *self.pids.lock().unwrap().get(exec_id).unwrap_or(&4242);
            // The exec id encodes the container id in these tests.
            let container_id = exec_id
                .split('-')
                .nth(1)
                .unwrap_or("unknown")
                .to_owned();
            Ok(ExecInfo { container_id, pid })
        }

        async fn events(&self, _: &str, _: &[&str]) -> Result<mpsc::Receiver<Event>> {
            unimplemented!("not used by agent tests")
        }
    }

    fn record(id: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_owned(),
            ip_address: "10.0.0.2".to_owned(),
            running: true,
            runtime: "runc".to_owned(),
            name: format!("/{id}"),
            image: "node-exporter:latest".to_owned(),
            labels: HashMap::new(),
            networks: HashMap::new(),
        }
    }

    fn manager(mock: Arc<MockRuntime>, params: &str) -> AgentManager {
        AgentManager::new(mock, PathBuf::from("/opt/node_exporter"), params)
    }

    #[tokio::test]
    async fn added_deploys_script_and_starts_agent_detached() {
        let mock = Arc::new(MockRuntime::default());
        let manager = manager(Arc::clone(&mock), "--no-collector.timex");

        manager.added(&record("c1")).await;

        let calls = mock.calls();
        assert_eq!(calls[0], "copy c1 /bin");
        // Launcher materialization through a single shell exec.
        assert!(calls[1].starts_with("exec_create c1 /bin/sh -c "));
        assert!(calls[1].contains("chmod 755 /bin/node_exporter"));
        assert!(calls[1].contains("echo $'#!/bin/sh' > /bin/kadvisor.sh"));
        assert!(calls[1].contains(">> /bin/kadvisor.sh"));
        assert!(calls[1].contains("chmod 755 /bin/kadvisor.sh"));
        assert!(calls[2].starts_with("exec_start"));
        assert!(calls[2].ends_with("detach=false"));
        // Agent launch with the tokenized params, detached.
        assert!(calls[3].contains("/bin/kadvisor.sh --no-collector.timex"));
        assert!(calls[4].ends_with("detach=true"));
        assert_eq!(manager.exec_handles.len(), 1);
    }

    #[tokio::test]
    async fn failed_deploy_leaves_no_handle() {
        let mock = Arc::new(MockRuntime {
            fail_copy: true,
            ..MockRuntime::default()
        });
        let manager = manager(Arc::clone(&mock), "");

        manager.added(&record("c1")).await;

        assert!(manager.exec_handles.is_empty());
        assert_eq!(mock.calls(), vec!["copy c1 /bin"]);
    }

    #[tokio::test]
    async fn removed_drops_the_handle_without_signalling() {
        let mock = Arc::new(MockRuntime::default());
        let manager = manager(Arc::clone(&mock), "");
        manager.added(&record("c1")).await;
        let calls_after_deploy = mock.calls().len();

        manager.removed(&record("c1"));

        assert!(manager.exec_handles.is_empty());
        assert_eq!(mock.calls().len(), calls_after_deploy);
    }

    #[tokio::test]
    async fn stop_kills_agents_by_resolved_pid() {
        let mock = Arc::new(MockRuntime::default());
        let manager = manager(Arc::clone(&mock), "");
        manager.added(&record("c1")).await;
        {
            let handle = manager.exec_handles.get("c1").unwrap();
            mock.pids
                .lock()
                .unwrap()
                .insert(handle.exec_id.clone(), 321);
        }

        manager.stop().await;

        let calls = mock.calls();
        assert!(calls.iter().any(|c| c == "exec_create c1 kill -9 321"));
    }

    #[tokio::test]
    async fn stop_continues_after_one_agent_fails() {
        let mock = Arc::new(MockRuntime {
            fail_exec_inspect_for: Some("c1".to_owned()),
            ..MockRuntime::default()
        });
        let manager = manager(Arc::clone(&mock), "");
        manager.added(&record("c1")).await;
        manager.added(&record("c2")).await;

        manager.stop().await;

        let calls = mock.calls();
        assert!(
            calls
                .iter()
                .any(|c| c.starts_with("exec_create c2 kill -9"))
        );
        assert!(!calls.iter().any(|c| c.starts_with("exec_create c1 kill")));
    }
}
