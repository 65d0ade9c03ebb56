use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use users::{Users, UsersCache};

pub const UNKNOWN_USER: &str = "unknown";

pub fn resolve_username(uid: u32, users_cache: &UsersCache) -> String {
    users_cache
        .get_user_by_uid(uid)
        .map(|user| user.name().to_string_lossy().to_string())
        .unwrap_or_else(|| uid.to_string())
}

/// Maps pids to the name of the OS user that owns them.
///
/// The process table is only refreshed for the pids passed to [`ProcessOwners::refresh`],
/// so a lookup costs one `/proc` read per GPU process rather than a full system scan.
pub struct ProcessOwners {
    system: System,
    users_cache: UsersCache,
}

impl ProcessOwners {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            users_cache: UsersCache::new(),
        }
    }

    pub fn refresh(&mut self, pids: &[u32]) {
        let pids: Vec<Pid> = pids.iter().map(|&pid| Pid::from_u32(pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::nothing().with_user(UpdateKind::OnlyIfNotSet),
        );
    }

    /// Owner of `pid` as of the last refresh, `"unknown"` if the process is gone.
    pub fn owner_of(&self, pid: u32) -> String {
        self.system
            .process(Pid::from_u32(pid))
            .and_then(|process| process.user_id())
            .map(|uid| resolve_username(**uid, &self.users_cache))
            .unwrap_or_else(|| UNKNOWN_USER.to_string())
    }
}

impl Default for ProcessOwners {
    fn default() -> Self {
        Self::new()
    }
}
