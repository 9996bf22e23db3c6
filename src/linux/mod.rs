use std::ffi::CStr;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use procfs::process::{FDTarget, Process};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::probe::{
    ProbeError, ProcessAttribute, ProcessProbe, ProcessRecord, ProcessSnapshot,
};
use crate::timestamp::Timestamp;

/// Settling time between the two CPU-time reads of a snapshot. Waited
/// once per snapshot, not once per PID.
const CPU_SETTLE: Duration = Duration::from_millis(100);

/// Process probe backed by `/proc`.
///
/// CPU usage needs two reads of each PID's accumulated tick count with a
/// settling wait in between; everything else is read in the second pass so
/// the snapshot is as coherent as `/proc` allows.
pub struct ProcfsProbe {
    ticks_per_second: u64,
    page_size: u64,
    username_cache: FxHashMap<u32, Option<String>>,
}

impl ProcfsProbe {
    pub fn new() -> ProcfsProbe {
        ProcfsProbe {
            ticks_per_second: procfs::ticks_per_second(),
            page_size: procfs::page_size(),
            username_cache: FxHashMap::default(),
        }
    }

    fn read_record(
        &mut self,
        process: &Process,
        first_cpu_ticks: u64,
        elapsed_secs: f64,
        inet_socket_inodes: &FxHashSet<u64>,
    ) -> Option<ProcessRecord> {
        let pid = process.pid;
        let stat = match process.stat() {
            Ok(stat) => stat,
            Err(err) => {
                // Vanished or access denied during the settling wait.
                warn!(
                    "skipping pid {pid}: {} unavailable: {err}",
                    ProcessAttribute::CpuPercent
                );
                return None;
            }
        };

        let second_cpu_ticks = stat.utime + stat.stime;
        let cpu_secs =
            second_cpu_ticks.saturating_sub(first_cpu_ticks) as f64 / self.ticks_per_second as f64;
        let cpu_percent = if elapsed_secs > 0.0 {
            cpu_secs / elapsed_secs * 100.0
        } else {
            0.0
        };

        let rss_bytes = u64::try_from(stat.rss).unwrap_or(0) * self.page_size;
        let threads_number = u64::try_from(stat.num_threads).unwrap_or(0);

        let username = match process.status() {
            Ok(status) => self.username_for_uid(status.ruid),
            Err(_) => {
                info!("pid {pid}: {} unavailable", ProcessAttribute::Username);
                None
            }
        };

        let mut open_files = Vec::new();
        let mut connections_number = 0u64;
        match process.fd() {
            Ok(fds) => {
                let mut seen = FxHashSet::default();
                for fd in fds.flatten() {
                    match fd.target {
                        FDTarget::Path(path) => {
                            let path = path.to_string_lossy().into_owned();
                            if seen.insert(path.clone()) {
                                open_files.push(path);
                            }
                        }
                        FDTarget::Socket(inode) => {
                            if inet_socket_inodes.contains(&inode) {
                                connections_number += 1;
                            }
                        }
                        _ => {}
                    }
                }
            }
            Err(_) => {
                // Kernel threads have no fd table; unprivileged reads of
                // other users' processes are denied. Both are fine.
                info!("pid {pid}: {} unavailable", ProcessAttribute::OpenFiles);
            }
        }

        Some(ProcessRecord {
            name: stat.comm,
            pid: u32::try_from(pid).unwrap_or(0),
            username,
            rss_bytes,
            cpu_percent,
            open_files,
            children_count: children_count(process),
            threads_number,
            connections_number,
        })
    }

    fn username_for_uid(&mut self, uid: u32) -> Option<String> {
        if let Some(cached) = self.username_cache.get(&uid) {
            return cached.clone();
        }
        let name = lookup_username(uid);
        self.username_cache.insert(uid, name.clone());
        name
    }
}

impl ProcessProbe for ProcfsProbe {
    fn snapshot(&mut self) -> Result<ProcessSnapshot, ProbeError> {
        let retrieval_timestamp = Timestamp::now();
        info!("retrieving running processes information");

        let processes = procfs::process::all_processes()
            .map_err(|err| ProbeError::Enumeration(err.to_string()))?;

        // First pass: remember each PID's accumulated CPU time.
        let mut primed = Vec::new();
        for process in processes.flatten() {
            match process.stat() {
                Ok(stat) => primed.push((process, stat.utime + stat.stime)),
                Err(err) => info!("skipping pid {}: {err}", process.pid),
            }
        }

        let primed_at = Instant::now();
        thread::sleep(CPU_SETTLE);
        let elapsed_secs = primed_at.elapsed().as_secs_f64();

        let inet_socket_inodes = inet_socket_inodes();

        let mut records = Vec::with_capacity(primed.len());
        for (process, first_cpu_ticks) in primed {
            if let Some(record) =
                self.read_record(&process, first_cpu_ticks, elapsed_secs, &inet_socket_inodes)
            {
                records.push(record);
            }
        }

        info!("finished retrieving {} processes", records.len());
        Ok(ProcessSnapshot {
            retrieval_timestamp,
            records,
        })
    }
}

/// Children across all of the process's threads.
fn children_count(process: &Process) -> u64 {
    let Ok(tasks) = process.tasks() else {
        info!(
            "pid {}: {} unavailable",
            process.pid,
            ProcessAttribute::ChildrenCount
        );
        return 0;
    };
    let mut count = 0u64;
    for task in tasks.flatten() {
        if let Ok(children) = task.children() {
            count += children.len() as u64;
        }
    }
    count
}

/// Inodes of every inet socket on the host, for classifying fd entries.
fn inet_socket_inodes() -> FxHashSet<u64> {
    let mut inodes = FxHashSet::default();
    if let Ok(entries) = procfs::net::tcp() {
        inodes.extend(entries.into_iter().map(|entry| entry.inode));
    }
    if let Ok(entries) = procfs::net::tcp6() {
        inodes.extend(entries.into_iter().map(|entry| entry.inode));
    }
    if let Ok(entries) = procfs::net::udp() {
        inodes.extend(entries.into_iter().map(|entry| entry.inode));
    }
    if let Ok(entries) = procfs::net::udp6() {
        inodes.extend(entries.into_iter().map(|entry| entry.inode));
    }
    inodes
}

fn lookup_username(uid: u32) -> Option<String> {
    let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf: Vec<libc::c_char> = vec![0; 1024];
    loop {
        let errno = unsafe {
            libc::getpwuid_r(
                uid,
                &mut passwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if errno == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if errno != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(passwd.pw_name) };
        return name.to_str().ok().map(str::to_owned);
    }
}
