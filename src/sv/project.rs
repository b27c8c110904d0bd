use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::sv::options::{ProcessOption, ProcfileOption};
use crate::sv::process::Process;
use crate::sv::tables::ProcTable;

const MAX_BASENAME_LEN: usize = 42;
const HASH_SUFFIX_BYTES: usize = 6;
const HASH_SUFFIX_LEN: usize = 8;

fn clean_char(c: char) -> bool {
    matches!(
        c,
        ' ' | '&' | '$' | '`' | '!' | '*' | '@' | '"' | '(' | ')' | '[' | ']' | '\\' | '\r'
            | '\n' | '\t'
    )
}

/// Compute the stable project identity for a work directory:
/// `<cleanedBasename>-<base64url(sha256(absPath))[..8]>`.
///
/// Shell-hostile characters in the basename are replaced with `_` and the
/// basename is truncated to 42 characters; the suffix hashes the absolute
/// path so the same directory always maps to the same identity.
pub fn app_name(cwd: &Path) -> anyhow::Result<String> {
    let abs = if cwd.is_absolute() {
        cwd.to_path_buf()
    } else {
        env::current_dir()?.join(cwd)
    };
    anyhow::ensure!(abs.exists(), "work directory {} does not exist", abs.display());

    let basename = abs
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());

    let mut clean: String = basename
        .chars()
        .map(|c| if clean_char(c) { '_' } else { c })
        .collect();
    if clean.len() > MAX_BASENAME_LEN {
        clean.truncate(MAX_BASENAME_LEN);
    }

    let hash = Sha256::digest(abs.to_string_lossy().as_bytes());
    let mut encoded = URL_SAFE.encode(&hash[..HASH_SUFFIX_BYTES]);
    encoded.truncate(HASH_SUFFIX_LEN);

    Ok(format!("{clean}-{encoded}"))
}

/// One application group: a set of processes sharing a work directory and
/// Procfile, with a per-process intended-running flag. The flag is only
/// flipped by start/stop transitions, never by observation.
#[derive(Debug)]
pub struct Project {
    pub name: String,
    pub work_dir: PathBuf,
    pub procfile: PathBuf,
    pub proc_table: ProcTable,
    running: RwLock<HashMap<String, bool>>,
}

impl Project {
    pub fn create(opt: &ProcfileOption) -> Arc<Self> {
        let mut running = HashMap::new();
        for name in opt.processes.keys() {
            running.insert(name.clone(), false);
        }
        Arc::new(Self {
            name: opt.app_name.clone(),
            work_dir: opt.work_dir.clone(),
            procfile: opt.procfile.clone(),
            proc_table: ProcTable::new(),
            running: RwLock::new(running),
        })
    }

    pub fn is_exist(&self, name: &str) -> bool {
        let running = self.running.read().unwrap_or_else(|p| p.into_inner());
        running.contains_key(name)
    }

    pub fn get_state(&self, name: &str) -> bool {
        let running = self.running.read().unwrap_or_else(|p| p.into_inner());
        running.get(name).copied().unwrap_or(false)
    }

    pub fn set_state(&self, name: &str, state: bool) {
        let mut running = self.running.write().unwrap_or_else(|p| p.into_inner());
        running.insert(name.to_string(), state);
    }

    /// Remove the intended-running flag only; the process entry is the
    /// caller's problem.
    pub fn unset(&self, name: &str) {
        let mut running = self.running.write().unwrap_or_else(|p| p.into_inner());
        running.remove(name);
    }

    pub fn proc_names(&self) -> Vec<String> {
        // Table order, so batch iteration is deterministic.
        let mut names: Vec<String> = self
            .proc_table
            .keys()
            .into_iter()
            .filter_map(|full| full.split_once("::").map(|(_, n)| n.to_string()))
            .collect();
        let running = self.running.read().unwrap_or_else(|p| p.into_inner());
        for name in running.keys() {
            if !names.iter().any(|n| n == name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Create the process if absent, insert it into this project's table
    /// and initialize its flag to not-running. Returns the (possibly
    /// pre-existing) process.
    pub fn register(&self, name: &str, opt: &ProcessOption, foreground: bool) -> Arc<Process> {
        let full_name = full_name(&self.name, name);
        if let Some(existing) = self.proc_table.get(&full_name) {
            return existing;
        }
        let proc = Arc::new(Process::new(&full_name, opt.clone(), foreground));
        self.proc_table.add(&full_name, proc.clone());
        let mut running = self.running.write().unwrap_or_else(|p| p.into_inner());
        running.entry(name.to_string()).or_insert(false);
        proc
    }
}

pub fn full_name(app: &str, proc: &str) -> String {
    format!("{app}::{proc}")
}

pub fn split_full_name(full: &str) -> (&str, &str) {
    match full.split_once("::") {
        Some((app, proc)) => (app, proc),
        None => ("", full),
    }
}

/// Unordered application table behind its own lock, kept separate from
/// the process registry to minimize lock scope.
#[derive(Debug, Default)]
pub struct ProjectTable {
    table: RwLock<HashMap<String, Arc<Project>>>,
}

impl ProjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Project>> {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.get(name).cloned()
    }

    /// Insert or replace; returns true when the name was not present yet.
    pub fn set(&self, name: &str, project: Arc<Project>) -> bool {
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        table.insert(name.to_string(), project).is_none()
    }

    /// Snapshot of the current entries; never exposes the inner map.
    pub fn entries(&self) -> Vec<(String, Arc<Project>)> {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}
