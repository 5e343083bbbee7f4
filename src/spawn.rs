//! Process spawning with enrollment into the run's control group between
//! fork and exec.
//!
//! Enrollment must complete before the first instruction of the target
//! program runs, or an early fork could escape the group. The group's
//! `cgroup.procs` files are opened in the parent; the child only issues
//! raw writes on the inherited descriptors, which is async-signal-safe
//! and allocation-free. Any enrollment failure aborts the exec.

use crate::cgroup::CgroupHandle;
use crate::error::{Result, RunError};
use crate::spec::{OutputSink, RunSpec, StdinSource};
use std::fs::File;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub(crate) struct SpawnedChild {
    pub child: Child,
    pub pid: u32,
    /// Spawn instant; wall time is measured from here.
    pub started: Instant,
    pub stdout_reader: Option<JoinHandle<Vec<u8>>>,
    pub stderr_reader: Option<JoinHandle<Vec<u8>>>,
}

pub(crate) fn spawn(spec: &RunSpec, group: &CgroupHandle) -> Result<SpawnedChild> {
    if let Some(dir) = &spec.working_dir {
        if !dir.is_dir() {
            return Err(RunError::SpawnFailed(format!(
                "working directory {} does not exist",
                dir.display()
            )));
        }
    }

    let mut cmd = Command::new(&spec.argv[0]);
    cmd.args(&spec.argv[1..]);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env_overrides {
        cmd.env(key, value);
    }

    cmd.stdin(match &spec.stdin {
        StdinSource::Null => Stdio::null(),
        StdinSource::File(path) => {
            let file = File::open(path).map_err(|e| {
                RunError::SpawnFailed(format!(
                    "cannot open stdin file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Stdio::from(file)
        }
    });
    cmd.stdout(sink_stdio(&spec.stdout, "stdout")?);
    cmd.stderr(sink_stdio(&spec.stderr, "stderr")?);

    // Must stay alive across spawn(): the child writes these descriptors
    // in pre_exec, and exec closes them on its own.
    let enroll_files = group.enroll_files()?;
    let enroll_fds: Vec<i32> = enroll_files.iter().map(|f| f.as_raw_fd()).collect();

    unsafe {
        cmd.pre_exec(move || {
            // Writing "0" enrolls the writing process itself.
            for &fd in &enroll_fds {
                let buf = b"0\n";
                let written = libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len());
                if written < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if written != buf.len() as isize {
                    return Err(std::io::Error::from_raw_os_error(libc::EIO));
                }
            }
            Ok(())
        });
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        RunError::SpawnFailed(format!("failed to start {:?}: {}", spec.argv[0], e))
    })?;
    drop(enroll_files);

    let pid = child.id();
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);
    log::debug!("spawned pid {} into group {}", pid, group.id());

    Ok(SpawnedChild {
        child,
        pid,
        started,
        stdout_reader,
        stderr_reader,
    })
}

fn sink_stdio(sink: &OutputSink, stream: &str) -> Result<Stdio> {
    Ok(match sink {
        OutputSink::Null => Stdio::null(),
        OutputSink::File(path) => {
            let file = File::create(path).map_err(|e| {
                RunError::SpawnFailed(format!(
                    "cannot create {} file {}: {}",
                    stream,
                    path.display(),
                    e
                ))
            })?;
            Stdio::from(file)
        }
        OutputSink::Capture => Stdio::piped(),
    })
}

/// Drain a capture pipe in the background so a chatty tree never blocks
/// on a full pipe while the executor waits.
fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        buffer
    })
}
