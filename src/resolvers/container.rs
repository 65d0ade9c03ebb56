use crate::resolvers::IdentityResolver;
use crate::utils::errors::ExporterError;
use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

const CONTAINER_ID_LEN: usize = 64;

/// Runtime-specific prefixes systemd puts in front of a container id in scope names
const SCOPE_PREFIXES: [&str; 4] = ["docker-", "cri-containerd-", "crio-", "libpod-"];

#[async_trait]
pub trait ContainerNames: Send + Sync {
    /// Human-readable name of the container, `None` if the runtime no longer knows it.
    async fn name_of(&self, container_id: &str) -> Result<Option<String>, ExporterError>;
}

/// Matches the Docker SDK's default request timeout
pub const DEFAULT_DOCKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Looks container names up with `docker inspect`.
///
/// A lookup that outlives `timeout` kills the child and fails, so a hung daemon turns into a
/// failed pass instead of a stuck one.
pub struct DockerCli {
    binary: PathBuf,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ContainerNames for DockerCli {
    async fn name_of(&self, container_id: &str) -> Result<Option<String>, ExporterError> {
        let mut inspect = Command::new(&self.binary);
        inspect
            .args(["inspect", "--format", "{{.Name}}", container_id])
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, inspect.output())
            .await
            .map_err(|_| {
                ExporterError::Resolver(format!(
                    "{} inspect {} timed out after {}s",
                    self.binary.display(),
                    container_id,
                    self.timeout.as_secs_f64()
                ))
            })?
            .map_err(|e| {
                ExporterError::Resolver(format!("Failed to run {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            debug!(
                "docker inspect {} failed: {}",
                container_id,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        let name = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_start_matches('/')
            .to_string();
        Ok((!name.is_empty()).then_some(name))
    }
}

/// Finds the container a process runs in from its cgroup membership.
pub struct ContainerResolver<N: ContainerNames> {
    proc_root: PathBuf,
    names: N,
    cache: Mutex<NameCache>,
}

/// Container id -> name, only successful lookups are kept. Entries not seen since the
/// last prune are dropped by [`IdentityResolver::finish_pass`].
#[derive(Default)]
struct NameCache {
    names: HashMap<String, String>,
    seen: HashSet<String>,
}

impl<N: ContainerNames> ContainerResolver<N> {
    pub fn new(proc_root: impl Into<PathBuf>, names: N) -> Self {
        Self {
            proc_root: proc_root.into(),
            names,
            cache: Mutex::new(NameCache::default()),
        }
    }

    async fn container_id_of(&self, pid: u32) -> Result<Option<String>, ExporterError> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        match tokio::fs::read_to_string(&path).await {
            Ok(cgroup) => Ok(parse_container_id(&cgroup)),
            // the process exited between enumeration and lookup
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ExporterError::Resolver(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn cached(&self, container_id: &str) -> Option<String> {
        let mut cache = self.cache.lock().ok()?;
        let name = cache.names.get(container_id).cloned()?;
        cache.seen.insert(container_id.to_string());
        Some(name)
    }

    fn remember(&self, container_id: &str, name: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.names.insert(container_id.to_string(), name.to_string());
            cache.seen.insert(container_id.to_string());
        }
    }

    #[cfg(test)]
    fn cached_ids(&self) -> Vec<String> {
        let cache = self.cache.lock().unwrap();
        let mut ids: Vec<String> = cache.names.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl<N: ContainerNames> IdentityResolver for ContainerResolver<N> {
    async fn resolve(&self, pid: u32) -> Result<Option<String>, ExporterError> {
        let Some(container_id) = self.container_id_of(pid).await? else {
            return Ok(None);
        };

        if let Some(name) = self.cached(&container_id) {
            return Ok(Some(name));
        }

        let name = self.names.name_of(&container_id).await?;
        if let Some(name) = &name {
            debug!("pid {} belongs to container {} ({})", pid, name, container_id);
            self.remember(&container_id, name);
        }
        Ok(name)
    }

    fn finish_pass(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            let NameCache { names, seen } = &mut *cache;
            let before = names.len();
            names.retain(|id, _| seen.contains(id));
            seen.clear();
            if names.len() < before {
                debug!("Forgot {} containers no longer running on a GPU", before - names.len());
            }
        }
    }
}

/// Extracts a container id from the contents of `/proc/<pid>/cgroup`.
///
/// Handles both cgroup v1 (`N:controllers:/docker/<id>`) and v2 / systemd layouts
/// (`0::/system.slice/docker-<id>.scope`, kubepods paths ending in the id).
pub fn parse_container_id(cgroup: &str) -> Option<String> {
    cgroup
        .lines()
        .filter_map(|line| line.splitn(3, ':').nth(2))
        .flat_map(|path| path.split('/'))
        .filter_map(container_id_from_segment)
        .next()
}

fn container_id_from_segment(segment: &str) -> Option<String> {
    let segment = segment.strip_suffix(".scope").unwrap_or(segment);
    let candidate = SCOPE_PREFIXES
        .iter()
        .find_map(|prefix| segment.strip_prefix(prefix))
        .unwrap_or(segment);

    let is_id = candidate.len() == CONTAINER_ID_LEN
        && candidate.chars().all(|c| c.is_ascii_hexdigit());
    is_id.then(|| candidate.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ID: &str = "3f4e2b9c8d7a6f5e4d3c2b1a0f9e8d7c6b5a4f3e2d1c0b9a8f7e6d5c4b3a2f1e";

    struct StaticNames {
        names: HashMap<String, String>,
        lookups: AtomicUsize,
    }

    impl StaticNames {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self {
                names: entries
                    .iter()
                    .map(|(id, name)| (id.to_string(), name.to_string()))
                    .collect(),
                lookups: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ContainerNames for StaticNames {
        async fn name_of(&self, container_id: &str) -> Result<Option<String>, ExporterError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.names.get(container_id).cloned())
        }
    }

    fn write_cgroup(root: &Path, pid: u32, contents: &str) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cgroup"), contents).unwrap();
    }

    #[test]
    fn test_parse_cgroup_v1_docker() {
        let cgroup = format!(
            "12:pids:/docker/{ID}\n11:memory:/docker/{ID}\n1:name=systemd:/docker/{ID}\n"
        );
        assert_eq!(parse_container_id(&cgroup).as_deref(), Some(ID));
    }

    #[test]
    fn test_parse_systemd_scopes() {
        for prefix in SCOPE_PREFIXES {
            let cgroup = format!("0::/system.slice/{prefix}{ID}.scope\n");
            assert_eq!(parse_container_id(&cgroup).as_deref(), Some(ID), "{prefix}");
        }
    }

    #[test]
    fn test_parse_kubepods() {
        let cgroup = format!(
            "0::/kubepods.slice/kubepods-burstable.slice/\
             kubepods-burstable-pod1234.slice/cri-containerd-{ID}.scope\n"
        );
        assert_eq!(parse_container_id(&cgroup).as_deref(), Some(ID));

        let cgroup = format!("11:cpu:/kubepods/besteffort/pod0e5f6a7b/{ID}\n");
        assert_eq!(parse_container_id(&cgroup).as_deref(), Some(ID));
    }

    #[test]
    fn test_parse_host_process() {
        assert_eq!(parse_container_id("0::/user.slice/user-1000.slice/session-2.scope\n"), None);
        assert_eq!(parse_container_id("0::/\n"), None);
        assert_eq!(parse_container_id(""), None);
    }

    #[test]
    // A 64-char segment that is not hex is not an id
    fn test_parse_rejects_non_hex() {
        let bogus = "z".repeat(CONTAINER_ID_LEN);
        assert_eq!(parse_container_id(&format!("0::/docker/{bogus}\n")), None);
    }

    #[tokio::test]
    async fn test_resolve_container_name_is_cached() {
        let proc_root = tempfile::tempdir().unwrap();
        write_cgroup(proc_root.path(), 100, &format!("0::/system.slice/docker-{ID}.scope\n"));
        write_cgroup(proc_root.path(), 101, &format!("0::/system.slice/docker-{ID}.scope\n"));

        let names = StaticNames::new(&[(ID, "teamA")]);
        let resolver = ContainerResolver::new(proc_root.path(), names);

        assert_eq!(resolver.resolve(100).await.unwrap().as_deref(), Some("teamA"));
        assert_eq!(resolver.resolve(101).await.unwrap().as_deref(), Some("teamA"));
        assert_eq!(resolver.names.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_host_process_skips_lookup() {
        let proc_root = tempfile::tempdir().unwrap();
        write_cgroup(proc_root.path(), 200, "0::/user.slice/user-1000.slice/session-2.scope\n");

        let resolver = ContainerResolver::new(proc_root.path(), StaticNames::new(&[]));

        assert_eq!(resolver.resolve(200).await.unwrap(), None);
        assert_eq!(resolver.names.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_exited_process() {
        let proc_root = tempfile::tempdir().unwrap();
        let resolver = ContainerResolver::new(proc_root.path(), StaticNames::new(&[]));
        assert_eq!(resolver.resolve(300).await.unwrap(), None);
    }

    #[tokio::test]
    // Unknown containers are looked up again on the next call
    async fn test_resolve_unknown_container_not_cached() {
        let proc_root = tempfile::tempdir().unwrap();
        write_cgroup(proc_root.path(), 400, &format!("12:pids:/docker/{ID}\n"));

        let resolver = ContainerResolver::new(proc_root.path(), StaticNames::new(&[]));

        assert_eq!(resolver.resolve(400).await.unwrap(), None);
        assert_eq!(resolver.resolve(400).await.unwrap(), None);
        assert_eq!(resolver.names.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    // Containers that stop showing up on a GPU are dropped at the end of the pass
    async fn test_finish_pass_prunes_departed_containers() {
        let other = "a".repeat(CONTAINER_ID_LEN);
        let proc_root = tempfile::tempdir().unwrap();
        write_cgroup(proc_root.path(), 100, &format!("0::/system.slice/docker-{ID}.scope\n"));
        write_cgroup(proc_root.path(), 101, &format!("0::/system.slice/docker-{other}.scope\n"));

        let names = StaticNames::new(&[(ID, "teamA"), (other.as_str(), "teamB")]);
        let resolver = ContainerResolver::new(proc_root.path(), names);

        resolver.resolve(100).await.unwrap();
        resolver.resolve(101).await.unwrap();
        resolver.finish_pass();
        assert_eq!(resolver.cached_ids(), vec![ID.to_string(), other.clone()]);

        // only the first container is still running on a GPU
        assert_eq!(resolver.resolve(100).await.unwrap().as_deref(), Some("teamA"));
        resolver.finish_pass();
        assert_eq!(resolver.cached_ids(), vec![ID.to_string()]);
        assert_eq!(resolver.names.lookups.load(Ordering::SeqCst), 2);

        // a pruned container is looked up again when it comes back
        assert_eq!(resolver.resolve(101).await.unwrap().as_deref(), Some("teamB"));
        assert_eq!(resolver.names.lookups.load(Ordering::SeqCst), 3);
    }

    fn fake_docker(dir: &Path, script: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_docker_cli_reads_name() {
        let bin = tempfile::tempdir().unwrap();
        let script = fake_docker(bin.path(), "echo /teamA");
        let docker = DockerCli::new(script, DEFAULT_DOCKER_TIMEOUT);
        assert_eq!(docker.name_of(ID).await.unwrap().as_deref(), Some("teamA"));
    }

    #[tokio::test]
    // A hung daemon fails the lookup instead of blocking the pass
    async fn test_docker_cli_times_out() {
        let bin = tempfile::tempdir().unwrap();
        let docker = DockerCli::new(
            fake_docker(bin.path(), "exec sleep 3600"),
            Duration::from_millis(200),
        );

        let proc_root = tempfile::tempdir().unwrap();
        write_cgroup(proc_root.path(), 100, &format!("0::/system.slice/docker-{ID}.scope\n"));
        let resolver = ContainerResolver::new(proc_root.path(), docker);

        let result = tokio::time::timeout(Duration::from_secs(10), resolver.resolve(100))
            .await
            .expect("lookup did not honour its timeout");
        assert!(matches!(result, Err(ExporterError::Resolver(_))));
    }

    #[tokio::test]
    async fn test_docker_cli_missing_binary() {
        let docker = DockerCli::new("/nonexistent/bin/docker", DEFAULT_DOCKER_TIMEOUT);
        let result = docker.name_of(ID).await;
        assert!(matches!(result, Err(ExporterError::Resolver(_))));
    }

    #[tokio::test]
    // A failing inspect means the runtime does not know the container
    async fn test_docker_cli_failed_inspect() {
        let docker = DockerCli::new("false", DEFAULT_DOCKER_TIMEOUT);
        assert_eq!(docker.name_of(ID).await.unwrap(), None);
    }
}
