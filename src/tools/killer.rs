use crate::config::{Config, StrategyOrder};
use crate::platform::ProcessApi;
use crate::server::ServerEntry;
use crate::tools::resolver::{CommandResolver, CommandSpec};
use crate::utils::kill_log::KillLog;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

/// Ancestor walk cap; real chains are a handful of hops, the bound only
/// guarantees the walk terminates on a corrupted process table.
const MAX_ANCESTOR_HOPS: usize = 20;

/// Descendant expansion cap. Trees are acyclic by OS construction, this is
/// the defensive depth limit on top.
const MAX_TREE_DEPTH: usize = 32;

/// Ports that usually front a shared reverse proxy rather than the server's
/// own process; the port strategy refuses them unless configured otherwise.
const PROXY_PORTS: &[u16] = &[80, 443];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KillStrategy {
    CommandPattern,
    Port,
}

/// Outcome of one kill attempt, consumable by the sidebar process.
#[derive(Debug, Serialize)]
pub struct KillReport {
    pub server: String,
    pub killed: bool,
    pub strategy: Option<KillStrategy>,
    pub signaled: usize,
}

pub struct ProcessKiller {
    config: Arc<Config>,
    api: Arc<dyn ProcessApi>,
    log: Arc<dyn KillLog>,
    resolver: CommandResolver,
}

impl ProcessKiller {
    pub fn new(config: Arc<Config>, api: Arc<dyn ProcessApi>, log: Arc<dyn KillLog>) -> Self {
        let resolver = CommandResolver::new(config.clone(), log.clone());
        Self {
            config,
            api,
            log,
            resolver,
        }
    }

    /// The sole public termination operation. Calling it when nothing is
    /// running is a safe no-op returning false; no failure escapes as an
    /// error, every decision lands in the kill log instead.
    pub async fn kill(&self, entry: &ServerEntry) -> bool {
        self.kill_report(entry).await.killed
    }

    #[instrument(skip(self, entry), fields(server = %entry.name))]
    pub async fn kill_report(&self, entry: &ServerEntry) -> KillReport {
        self.note(format!(
            "[{}] kill requested (command: '{}', url: '{}')",
            entry.name, entry.start_command, entry.url
        ))
        .await;
        let spec = self.resolver.resolve(&entry.start_command).await;
        self.run_strategies(&entry.name, &spec, &entry.url).await
    }

    /// Both strategies are always attempted; the configured order decides
    /// which gets the first shot when both could succeed.
    async fn run_strategies(&self, name: &str, spec: &CommandSpec, url: &str) -> KillReport {
        let order = match self.config.strategy_order {
            StrategyOrder::PatternFirst => [KillStrategy::CommandPattern, KillStrategy::Port],
            StrategyOrder::PortFirst => [KillStrategy::Port, KillStrategy::CommandPattern],
        };

        for strategy in order {
            let candidates = match strategy {
                KillStrategy::CommandPattern => self.pattern_candidates(name, spec).await,
                KillStrategy::Port => self.port_candidates(name, url).await,
            };
            let Some(candidates) = candidates else {
                continue;
            };

            let (doomed, refused) = self.collect_targets(name, &candidates).await;
            if doomed.is_empty() {
                if refused {
                    self.note(format!(
                        "[{}] every {:?} match is inside our own process tree; refusing to kill",
                        name, strategy
                    ))
                    .await;
                } else {
                    self.note(format!("[{}] {:?} yielded no killable process", name, strategy))
                        .await;
                }
                continue;
            }

            let signaled = self.api.terminate(&doomed).await;
            self.note(format!(
                "[{}] signaled {} process(es) via {:?}: {:?}",
                name,
                doomed.len(),
                strategy,
                doomed
            ))
            .await;
            return KillReport {
                server: name.to_string(),
                killed: true,
                strategy: Some(strategy),
                signaled,
            };
        }

        self.note(format!("[{}] no strategy found a process to kill", name))
            .await;
        KillReport {
            server: name.to_string(),
            killed: false,
            strategy: None,
            signaled: 0,
        }
    }

    /// Probes each candidate pattern against live command lines, stopping at
    /// the first pattern with any match. A working-directory hint narrows
    /// matches to that directory or a subdirectory of it; if the hint rules
    /// out every match, the strategy is abandoned rather than falling back
    /// to the unfiltered set (killing a same-named process in an unrelated
    /// checkout is worse than killing nothing).
    async fn pattern_candidates(&self, name: &str, spec: &CommandSpec) -> Option<Vec<u32>> {
        for pattern in &spec.patterns {
            let records = match self.api.processes_matching(pattern).await {
                Ok(records) => records,
                Err(e) => {
                    self.note(format!(
                        "[{}] process listing failed for pattern '{}': {}",
                        name, pattern, e
                    ))
                    .await;
                    return None;
                }
            };
            if records.is_empty() {
                self.note(format!("[{}] pattern '{}' matched nothing", name, pattern))
                    .await;
                continue;
            }
            self.note(format!(
                "[{}] pattern '{}' matched {} process(es)",
                name,
                pattern,
                records.len()
            ))
            .await;
            for record in &records {
                self.note(format!(
                    "[{}]   pid {} ({}): {}",
                    name, record.pid, record.name, record.command
                ))
                .await;
            }

            let mut pids: Vec<u32> = records.iter().map(|r| r.pid).collect();
            if let Some(cwd) = &spec.cwd {
                let mut kept = Vec::new();
                for &pid in &pids {
                    match self.api.working_directory(pid).await {
                        Some(dir) if dir.starts_with(cwd) => kept.push(pid),
                        Some(dir) => {
                            self.note(format!(
                                "[{}] pid {} runs in {} (outside {}); dropped",
                                name,
                                pid,
                                dir.display(),
                                cwd.display()
                            ))
                            .await;
                        }
                        None => {
                            self.note(format!(
                                "[{}] pid {} has no readable working directory; dropped",
                                name, pid
                            ))
                            .await;
                        }
                    }
                }
                if kept.is_empty() {
                    self.note(format!(
                        "[{}] working-directory filter removed every match for '{}'; abandoning pattern strategy",
                        name, pattern
                    ))
                    .await;
                    return None;
                }
                pids = kept;
            }
            return Some(pids);
        }
        None
    }

    async fn port_candidates(&self, name: &str, url: &str) -> Option<Vec<u32>> {
        let Some(port) = port_from_url(url) else {
            self.note(format!("[{}] no TCP port derivable from '{}'", name, url))
                .await;
            return None;
        };
        if PROXY_PORTS.contains(&port) && !self.config.kill_proxy_ports {
            self.note(format!(
                "[{}] port {} is a shared proxy port; skipping port strategy",
                name, port
            ))
            .await;
            return None;
        }
        match self.api.listeners_on_port(port).await {
            Ok(pids) if !pids.is_empty() => {
                self.note(format!(
                    "[{}] port {} has {} listener(s): {:?}",
                    name,
                    port,
                    pids.len(),
                    pids
                ))
                .await;
                Some(pids)
            }
            Ok(_) => {
                self.note(format!("[{}] nothing listening on port {}", name, port))
                    .await;
                None
            }
            Err(e) => {
                self.note(format!("[{}] port probe failed on {}: {}", name, port, e))
                    .await;
                None
            }
        }
    }

    /// The safe-kill pipeline: expands each surviving candidate to its full
    /// descendant subtree, with the own-ancestry exclusion applied at every
    /// level. Returns the termination set plus whether anything was dropped
    /// for being our own ancestry, so "found but refused" can be logged
    /// distinctly from "found nothing".
    async fn collect_targets(&self, name: &str, candidates: &[u32]) -> (Vec<u32>, bool) {
        let own = self.own_process_chain().await;
        let mut doomed = Vec::new();
        let mut seen: HashSet<u32> = HashSet::new();
        let mut refused = false;

        for &pid in candidates {
            if own.contains(&pid) {
                refused = true;
                self.note(format!("[{}] pid {} is in our own ancestry; excluded", name, pid))
                    .await;
                continue;
            }
            let mut stack = vec![(pid, 0usize)];
            while let Some((current, depth)) = stack.pop() {
                if own.contains(&current) {
                    refused = true;
                    continue;
                }
                if !seen.insert(current) {
                    continue;
                }
                doomed.push(current);
                if depth >= MAX_TREE_DEPTH {
                    debug!(pid = current, "descendant walk hit depth bound");
                    continue;
                }
                for child in self.api.children_of(current).await {
                    stack.push((child, depth + 1));
                }
            }
        }
        (doomed, refused)
    }

    /// Our own PID plus every ancestor below init. Bounded hop count so the
    /// walk terminates even if the table reports a parent cycle.
    async fn own_process_chain(&self) -> HashSet<u32> {
        let own_pid = self.api.current_pid();
        let mut own = HashSet::from([own_pid]);
        let mut current = own_pid;
        for _ in 0..MAX_ANCESTOR_HOPS {
            match self.api.parent_of(current).await {
                Some(parent) if parent > 1 => {
                    if !own.insert(parent) {
                        break;
                    }
                    current = parent;
                }
                _ => break,
            }
        }
        own
    }

    async fn note(&self, line: String) {
        debug!("{}", line);
        self.log.log(&line).await;
    }
}

/// URL to TCP port: explicit port wins, otherwise 443 for https and 80 for
/// http; anything else is undefined.
fn port_from_url(url_str: &str) -> Option<u16> {
    let parsed = Url::parse(url_str).ok()?;
    if let Some(port) = parsed.port() {
        return Some(port);
    }
    match parsed.scheme() {
        "https" => Some(443),
        "http" => Some(80),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::platform::ProcessRecord;
    use crate::utils::kill_log::MemoryKillLog;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct MockProc {
        pid: u32,
        ppid: u32,
        command: &'static str,
        cwd: Option<&'static str>,
    }

    struct MockApi {
        own_pid: u32,
        table: Vec<MockProc>,
        listeners: HashMap<u16, Vec<u32>>,
        terminated: StdMutex<Vec<u32>>,
    }

    impl MockApi {
        fn new(own_pid: u32, table: Vec<MockProc>) -> Self {
            Self {
                own_pid,
                table,
                listeners: HashMap::new(),
                terminated: StdMutex::new(Vec::new()),
            }
        }

        fn with_listener(mut self, port: u16, pids: Vec<u32>) -> Self {
            self.listeners.insert(port, pids);
            self
        }

        fn terminated(&self) -> Vec<u32> {
            self.terminated.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessApi for MockApi {
        fn current_pid(&self) -> u32 {
            self.own_pid
        }

        async fn processes_matching(&self, pattern: &str) -> Result<Vec<ProcessRecord>, AppError> {
            Ok(self
                .table
                .iter()
                .filter(|p| p.command.contains(pattern))
                .map(|p| ProcessRecord {
                    pid: p.pid,
                    name: p.command.split_whitespace().next().unwrap_or("").to_string(),
                    command: p.command.to_string(),
                })
                .collect())
        }

        async fn listeners_on_port(&self, port: u16) -> Result<Vec<u32>, AppError> {
            Ok(self.listeners.get(&port).cloned().unwrap_or_default())
        }

        async fn parent_of(&self, pid: u32) -> Option<u32> {
            self.table.iter().find(|p| p.pid == pid).map(|p| p.ppid)
        }

        async fn children_of(&self, pid: u32) -> Vec<u32> {
            self.table
                .iter()
                .filter(|p| p.ppid == pid)
                .map(|p| p.pid)
                .collect()
        }

        async fn working_directory(&self, pid: u32) -> Option<PathBuf> {
            self.table
                .iter()
                .find(|p| p.pid == pid)
                .and_then(|p| p.cwd.map(PathBuf::from))
        }

        async fn terminate(&self, pids: &[u32]) -> usize {
            self.terminated.lock().unwrap().extend_from_slice(pids);
            pids.len()
        }
    }

    fn test_config(order: StrategyOrder, kill_proxy_ports: bool) -> Arc<Config> {
        Arc::new(Config {
            default_shell: Some("/bin/sh".to_string()),
            shell_resolve_timeout: Duration::from_millis(2000),
            port_probe_timeout: Duration::from_millis(2000),
            strategy_order: order,
            kill_proxy_ports,
            health_timeout: Duration::from_millis(2000),
            kill_log_file: std::env::temp_dir().join("dev-reaper-test.log"),
            log_level: "debug".to_string(),
        })
    }

    fn killer_with(
        api: MockApi,
        order: StrategyOrder,
        kill_proxy_ports: bool,
    ) -> (ProcessKiller, Arc<MockApi>, Arc<MemoryKillLog>) {
        let api = Arc::new(api);
        let log = Arc::new(MemoryKillLog::new());
        let killer = ProcessKiller::new(
            test_config(order, kill_proxy_ports),
            api.clone(),
            log.clone(),
        );
        (killer, api, log)
    }

    fn spec(patterns: &[&str], cwd: Option<&str>) -> CommandSpec {
        CommandSpec {
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            cwd: cwd.map(PathBuf::from),
        }
    }

    // Own process 100 under shell 50 under init; the tool itself must never
    // land in a termination set.
    fn own_tree() -> Vec<MockProc> {
        vec![
            MockProc {
                pid: 50,
                ppid: 1,
                command: "zsh -l",
                cwd: None,
            },
            MockProc {
                pid: 100,
                ppid: 50,
                command: "dev-reaper kill",
                cwd: None,
            },
        ]
    }

    #[tokio::test]
    async fn pattern_match_in_subdirectory_kills_with_descendants() {
        let mut table = own_tree();
        table.push(MockProc {
            pid: 300,
            ppid: 1,
            command: "npm run dev",
            cwd: Some("/app/server"),
        });
        table.push(MockProc {
            pid: 301,
            ppid: 300,
            command: "node server.js",
            cwd: Some("/app/server"),
        });
        let (killer, api, _log) =
            killer_with(MockApi::new(100, table), StrategyOrder::PatternFirst, false);

        let entry = ServerEntry::new("web", "http://localhost:3000", "cd /app && npm run dev");
        let report = killer.kill_report(&entry).await;

        assert!(report.killed);
        assert_eq!(report.strategy, Some(KillStrategy::CommandPattern));
        assert_eq!(report.signaled, 2);
        let mut terminated = api.terminated();
        terminated.sort_unstable();
        assert_eq!(terminated, vec![300, 301]);
    }

    #[tokio::test]
    async fn directory_filter_abandons_then_port_strategy_rescues() {
        // An unrelated process matches the resolved alias pattern but runs
        // in the wrong directory; the listener on the derived port is the
        // one that gets killed.
        let mut table = own_tree();
        table.push(MockProc {
            pid: 400,
            ppid: 1,
            command: "node index.js",
            cwd: Some("/somewhere/else"),
        });
        table.push(MockProc {
            pid: 500,
            ppid: 1,
            command: "serve-backend",
            cwd: Some("/x"),
        });
        let api = MockApi::new(100, table).with_listener(8443, vec![500]);
        let (killer, api, log) = killer_with(api, StrategyOrder::PatternFirst, false);

        let report = killer
            .run_strategies(
                "api",
                &spec(&["node index.js"], Some("/x")),
                "https://localhost:8443",
            )
            .await;

        assert!(report.killed);
        assert_eq!(report.strategy, Some(KillStrategy::Port));
        assert_eq!(api.terminated(), vec![500]);
        assert!(log.contains("abandoning pattern strategy"));
    }

    #[tokio::test]
    async fn default_https_port_is_never_targeted() {
        let api = MockApi::new(100, own_tree()).with_listener(443, vec![600]);
        let (killer, api, log) = killer_with(api, StrategyOrder::PatternFirst, false);

        let report = killer
            .run_strategies("prod", &spec(&["ghost-server"], None), "https://app.local")
            .await;

        assert!(!report.killed);
        assert_eq!(report.strategy, None);
        assert!(api.terminated().is_empty());
        assert!(log.contains("shared proxy port"));
    }

    #[tokio::test]
    async fn default_http_port_is_never_targeted() {
        let api = MockApi::new(100, own_tree()).with_listener(80, vec![610]);
        let (killer, api, log) = killer_with(api, StrategyOrder::PatternFirst, false);

        let report = killer
            .run_strategies("plain", &spec(&["ghost-server"], None), "http://app.local")
            .await;

        assert!(!report.killed);
        assert!(api.terminated().is_empty());
        assert!(log.contains("shared proxy port"));
    }

    #[tokio::test]
    async fn own_process_is_refused_and_logged_distinctly() {
        // The tool's own command line matches the pattern; nothing else does.
        let (killer, api, log) = killer_with(
            MockApi::new(100, own_tree()),
            StrategyOrder::PatternFirst,
            false,
        );

        let report = killer
            .run_strategies("self", &spec(&["dev-reaper"], None), "http://localhost:9")
            .await;

        assert!(!report.killed);
        assert!(api.terminated().is_empty());
        assert!(log.contains("refusing to kill"));
    }

    #[tokio::test]
    async fn ancestor_shell_is_excluded() {
        let (killer, api, _log) = killer_with(
            MockApi::new(100, own_tree()),
            StrategyOrder::PatternFirst,
            false,
        );

        let report = killer
            .run_strategies("shell", &spec(&["zsh"], None), "http://localhost:9")
            .await;

        assert!(!report.killed);
        assert!(api.terminated().is_empty());
    }

    #[tokio::test]
    async fn childless_candidate_expands_to_itself_only() {
        let mut table = own_tree();
        table.push(MockProc {
            pid: 700,
            ppid: 1,
            command: "cargo run --bin api",
            cwd: None,
        });
        let (killer, api, _log) =
            killer_with(MockApi::new(100, table), StrategyOrder::PatternFirst, false);

        let report = killer
            .run_strategies("api", &spec(&["cargo run"], None), "http://localhost:9")
            .await;

        assert!(report.killed);
        assert_eq!(api.terminated(), vec![700]);
    }

    #[tokio::test]
    async fn descendant_expansion_is_transitive() {
        let mut table = own_tree();
        table.push(MockProc {
            pid: 300,
            ppid: 1,
            command: "npm run dev",
            cwd: None,
        });
        table.push(MockProc {
            pid: 301,
            ppid: 300,
            command: "node server.js",
            cwd: None,
        });
        table.push(MockProc {
            pid: 302,
            ppid: 300,
            command: "esbuild --watch",
            cwd: None,
        });
        table.push(MockProc {
            pid: 303,
            ppid: 302,
            command: "esbuild-worker",
            cwd: None,
        });
        let (killer, api, _log) =
            killer_with(MockApi::new(100, table), StrategyOrder::PatternFirst, false);

        let report = killer
            .run_strategies("web", &spec(&["npm run dev"], None), "http://localhost:9")
            .await;

        assert!(report.killed);
        let mut terminated = api.terminated();
        terminated.sort_unstable();
        assert_eq!(terminated, vec![300, 301, 302, 303]);
    }

    #[tokio::test]
    async fn port_first_order_prefers_the_listener() {
        let mut table = own_tree();
        table.push(MockProc {
            pid: 300,
            ppid: 1,
            command: "npm run dev",
            cwd: None,
        });
        table.push(MockProc {
            pid: 500,
            ppid: 1,
            command: "vite preview",
            cwd: None,
        });
        let api = MockApi::new(100, table).with_listener(3001, vec![500]);
        let (killer, api, _log) = killer_with(api, StrategyOrder::PortFirst, false);

        let report = killer
            .run_strategies("web", &spec(&["npm run dev"], None), "http://localhost:3001")
            .await;

        assert_eq!(report.strategy, Some(KillStrategy::Port));
        assert_eq!(api.terminated(), vec![500]);
    }

    #[tokio::test]
    async fn proxy_port_opt_in_allows_port_80() {
        let mut table = own_tree();
        table.push(MockProc {
            pid: 600,
            ppid: 1,
            command: "python -m http.server 80",
            cwd: None,
        });
        let api = MockApi::new(100, table).with_listener(80, vec![600]);
        let (killer, api, _log) = killer_with(api, StrategyOrder::PatternFirst, true);

        let report = killer
            .run_strategies("plain", &spec(&["no-such-pattern"], None), "http://localhost")
            .await;

        assert!(report.killed);
        assert_eq!(report.strategy, Some(KillStrategy::Port));
        assert_eq!(api.terminated(), vec![600]);
    }

    #[tokio::test]
    async fn later_pattern_is_probed_when_earlier_finds_nothing() {
        let mut table = own_tree();
        table.push(MockProc {
            pid: 800,
            ppid: 1,
            command: "./server --port 8080",
            cwd: None,
        });
        let (killer, api, _log) =
            killer_with(MockApi::new(100, table), StrategyOrder::PatternFirst, false);

        let report = killer
            .run_strategies(
                "built",
                &spec(
                    &["make build && ./server --port 8080", "./server --port 8080", "make build"],
                    None,
                ),
                "http://localhost:9",
            )
            .await;

        assert!(report.killed);
        assert_eq!(api.terminated(), vec![800]);
    }

    #[test]
    fn url_port_derivation() {
        assert_eq!(port_from_url("https://localhost:8443"), Some(8443));
        assert_eq!(port_from_url("http://localhost:3000/admin"), Some(3000));
        assert_eq!(port_from_url("https://app.local"), Some(443));
        assert_eq!(port_from_url("http://app.local"), Some(80));
        assert_eq!(port_from_url("ftp://app.local"), None);
        assert_eq!(port_from_url("not a url"), None);
    }
}
