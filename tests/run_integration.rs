//! End-to-end runs against the real cgroup facility.
//!
//! Every test needs root and a usable cgroup hierarchy; without them it
//! prints a skip notice and passes vacuously, so the suite stays green
//! on unprivileged developer machines.

use runcage::{
    CancelToken, LimitKind, OutputSink, ResourceLimits, RunExecutor, RunSpec, RunStatus,
    StdinSource,
};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// Pinned tests share the process-wide claim table; serialize them so
/// parallel test threads never fight over the same cores.
static PIN_GATE: Mutex<()> = Mutex::new(());

fn limited_executor() -> Option<RunExecutor> {
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("skipping: requires root");
        return None;
    }
    match RunExecutor::new() {
        Ok(executor) => Some(executor),
        Err(err) => {
            eprintln!("skipping: {}", err);
            None
        }
    }
}

fn sh(script: &str) -> RunSpec {
    RunSpec::new(vec![
        OsString::from("sh"),
        OsString::from("-c"),
        OsString::from(script),
    ])
}

fn capturing(mut spec: RunSpec) -> RunSpec {
    spec.stdout = OutputSink::Capture;
    spec.stderr = OutputSink::Capture;
    spec
}

#[test]
fn exit_code_is_reported_verbatim() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let result = executor.execute(&sh("exit 7")).unwrap();
    assert_eq!(result.status, RunStatus::Exited);
    assert_eq!(result.exit_code, Some(7));
    assert_eq!(result.term_signal, None);
    assert_eq!(result.limit, None);
    let usage = result
        .usage
        .expect("measurement should survive a clean exit");
    assert!(usage.cpu_time < Duration::from_secs(5));
}

#[test]
fn fatal_signal_is_reported_verbatim() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let result = executor.execute(&sh("kill -USR1 $$")).unwrap();
    assert_eq!(result.status, RunStatus::Signaled);
    assert_eq!(result.term_signal, Some(libc::SIGUSR1));
    assert_eq!(result.exit_code, None);
}

#[test]
fn captured_stdout_reaches_the_result() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let result = executor
        .execute(&capturing(sh("echo out-marker; echo err-marker >&2")))
        .unwrap();
    assert_eq!(result.status, RunStatus::Exited);
    assert_eq!(result.stdout.as_deref(), Some("out-marker\n"));
    assert_eq!(result.stderr.as_deref(), Some("err-marker\n"));
}

#[test]
fn file_redirection_writes_the_target() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("stdout.log");
    let mut spec = sh("echo into-file");
    spec.stdout = OutputSink::File(target.clone());
    let result = executor.execute(&spec).unwrap();
    assert_eq!(result.status, RunStatus::Exited);
    assert_eq!(result.stdout, None);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "into-file\n");
}

#[test]
fn stdin_can_come_from_a_file() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    let mut file = std::fs::File::create(&input).unwrap();
    writeln!(file, "line from file").unwrap();
    drop(file);

    let mut spec = capturing(sh("cat"));
    spec.stdin = StdinSource::File(input);
    let result = executor.execute(&spec).unwrap();
    assert_eq!(result.stdout.as_deref(), Some("line from file\n"));
}

#[test]
fn environment_overrides_reach_the_target() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let mut spec = capturing(sh("echo \"$RUNCAGE_TEST_MARKER\""));
    spec.env_overrides = vec![(
        OsString::from("RUNCAGE_TEST_MARKER"),
        OsString::from("present"),
    )];
    let result = executor.execute(&spec).unwrap();
    assert_eq!(result.stdout.as_deref(), Some("present\n"));
}

#[test]
fn working_dir_applies_to_the_target() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let mut spec = capturing(sh("pwd"));
    spec.working_dir = Some(dir.path().to_path_buf());
    let result = executor.execute(&spec).unwrap();
    let printed = result.stdout.unwrap();
    // tempdir may sit behind a symlink (e.g. /tmp on some hosts).
    let canonical = std::fs::canonicalize(dir.path()).unwrap();
    assert_eq!(printed.trim_end(), canonical.to_str().unwrap());
}

#[test]
fn missing_program_is_a_spawn_failure() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let spec = RunSpec::new(vec![OsString::from("/nonexistent/runcage-no-such-binary")]);
    let err = executor.execute(&spec).unwrap_err();
    assert!(matches!(err, runcage::RunError::SpawnFailed(_)), "{err}");
}

#[test]
fn cpu_limit_kills_a_spinning_tree() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let mut spec = sh("while :; do :; done");
    spec.limits = ResourceLimits {
        cpu_time: Some(Duration::from_secs(1)),
        wall_time: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let result = executor.execute(&spec).unwrap();
    assert_eq!(result.status, RunStatus::LimitExceeded);
    assert_eq!(result.limit, Some(LimitKind::Cpu));
    assert_eq!(result.termination_reason(), Some("cputime"));
    let usage = result.usage.expect("counters outlive the kill");
    assert!(usage.cpu_time >= Duration::from_millis(900), "{:?}", usage);
    assert!(result.wall_time < Duration::from_secs(20));
}

#[test]
fn wall_limit_kills_a_sleeping_tree() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let mut spec = sh("sleep 60");
    spec.limits = ResourceLimits {
        wall_time: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let result = executor.execute(&spec).unwrap();
    assert_eq!(result.status, RunStatus::LimitExceeded);
    assert_eq!(result.limit, Some(LimitKind::Wall));
    assert_eq!(result.termination_reason(), Some("walltime"));
    assert!(result.wall_time >= Duration::from_secs(1));
    assert!(result.wall_time < Duration::from_secs(30));
}

#[test]
fn memory_limit_kills_a_hungry_tree() {
    let Some(executor) = limited_executor() else {
        return;
    };
    // dd allocates its block buffer up front; 64 MiB against a 32 MiB
    // ceiling. bs is numeric to stay portable across dd flavors.
    let mut spec = sh("dd if=/dev/zero of=/dev/null bs=67108864 count=2");
    spec.limits = ResourceLimits {
        memory: Some(32 << 20),
        wall_time: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let result = executor.execute(&spec).unwrap();
    assert_eq!(result.status, RunStatus::LimitExceeded);
    assert_eq!(result.limit, Some(LimitKind::Memory));
    assert_eq!(result.termination_reason(), Some("memory"));
    // The hog was stopped at the ceiling, so the recorded peak sits
    // near 32 MiB: well above half, never wildly past the cap.
    let usage = result.usage.expect("counters outlive the kill");
    assert!(
        usage.peak_memory >= 16 << 20,
        "peak {} nowhere near the ceiling",
        usage.peak_memory
    );
    assert!(
        usage.peak_memory <= 48 << 20,
        "peak {} far past the ceiling",
        usage.peak_memory
    );
}

#[test]
fn background_children_do_not_outlive_the_run() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let mut spec = capturing(sh("sleep 300 & echo $!; wait"));
    spec.limits = ResourceLimits {
        wall_time: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let result = executor.execute(&spec).unwrap();
    assert_eq!(result.status, RunStatus::LimitExceeded);

    let printed = result.stdout.unwrap();
    let pid: i32 = printed
        .trim()
        .parse()
        .expect("shell printed the sleeper pid");
    // After execute returns the group was empty, so the sleeper is gone.
    let alive = unsafe { libc::kill(pid, 0) } == 0;
    assert!(!alive, "background sleeper {} survived the run", pid);
}

#[test]
fn root_exit_does_not_end_the_run() {
    let Some(executor) = limited_executor() else {
        return;
    };
    // The root forks a long sleeper and exits at once. Liveness comes
    // from group membership, so the run keeps going until the wall
    // limit kills the orphan, and the root's own exit code survives.
    let mut spec = sh("sleep 300 & exit 0");
    spec.limits = ResourceLimits {
        wall_time: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    let result = executor.execute(&spec).unwrap();
    assert_eq!(result.status, RunStatus::LimitExceeded);
    assert_eq!(result.limit, Some(LimitKind::Wall));
    assert_eq!(result.exit_code, Some(0));
    assert!(
        result.wall_time >= Duration::from_secs(2),
        "{:?}",
        result.wall_time
    );
    assert!(
        result.wall_time < Duration::from_secs(30),
        "{:?}",
        result.wall_time
    );
}

#[test]
fn sequential_runs_are_idempotent() {
    let Some(executor) = limited_executor() else {
        return;
    };
    for round in 0..5 {
        let result = executor.execute(&sh("true")).unwrap();
        assert_eq!(result.status, RunStatus::Exited, "round {}", round);
        assert_eq!(result.exit_code, Some(0), "round {}", round);
    }
}

#[test]
fn pinned_run_sees_only_the_requested_cores() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let _gate = PIN_GATE.lock().unwrap();
    let mut spec = capturing(sh("grep Cpus_allowed_list /proc/self/status"));
    spec.limits = ResourceLimits {
        cores: Some(BTreeSet::from([0])),
        ..Default::default()
    };
    let result = executor.execute(&spec).unwrap();
    assert_eq!(result.status, RunStatus::Exited);
    let line = result.stdout.unwrap();
    let allowed = line.split(':').nth(1).map(str::trim).unwrap_or("");
    assert_eq!(allowed, "0", "unexpected affinity line: {:?}", line);
}

#[test]
fn overlapping_pins_are_refused_while_a_run_holds_them() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let _gate = PIN_GATE.lock().unwrap();
    let mut first = sh("sleep 2");
    first.limits = ResourceLimits {
        cores: Some(BTreeSet::from([0])),
        wall_time: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    let mut second = sh("true");
    second.limits = ResourceLimits {
        cores: Some(BTreeSet::from([0])),
        ..Default::default()
    };

    std::thread::scope(|scope| {
        let holder = scope.spawn(|| executor.execute(&first).unwrap());
        std::thread::sleep(Duration::from_millis(300));
        let err = executor.execute(&second).unwrap_err();
        assert!(
            matches!(err, runcage::RunError::ResourceUnavailable(_)),
            "{err}"
        );
        let held = holder.join().unwrap();
        assert_eq!(held.status, RunStatus::Exited);
    });
}

#[test]
fn disjoint_pins_run_concurrently() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let topology = runcage::host::Topology::probe().unwrap();
    if topology.online_cpus.len() < 2 {
        eprintln!("skipping: needs at least two online cpus");
        return;
    }
    let _gate = PIN_GATE.lock().unwrap();
    let mut cpus = topology.online_cpus.iter().copied();
    let first_core = cpus.next().unwrap();
    let second_core = cpus.next().unwrap();

    let mut first = sh("sleep 1");
    first.limits = ResourceLimits {
        cores: Some(BTreeSet::from([first_core])),
        ..Default::default()
    };
    let mut second = sh("sleep 1");
    second.limits = ResourceLimits {
        cores: Some(BTreeSet::from([second_core])),
        ..Default::default()
    };

    std::thread::scope(|scope| {
        let left = scope.spawn(|| executor.execute(&first).unwrap());
        let right = scope.spawn(|| executor.execute(&second).unwrap());
        assert_eq!(left.join().unwrap().status, RunStatus::Exited);
        assert_eq!(right.join().unwrap().status, RunStatus::Exited);
    });
}

#[test]
fn concurrent_runs_measure_their_own_cpu() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let topology = runcage::host::Topology::probe().unwrap();
    if topology.online_cpus.len() < 2 {
        eprintln!("skipping: needs at least two online cpus");
        return;
    }
    let _gate = PIN_GATE.lock().unwrap();
    let mut cpus = topology.online_cpus.iter().copied();
    let spin_core = cpus.next().unwrap();
    let idle_core = cpus.next().unwrap();

    // A spinner next to a sleeper; if accounting leaked across groups
    // the sleeper would be charged with the spinner's CPU time.
    let mut spinner = sh("while :; do :; done");
    spinner.limits = ResourceLimits {
        cores: Some(BTreeSet::from([spin_core])),
        wall_time: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let mut sleeper = sh("sleep 1");
    sleeper.limits = ResourceLimits {
        cores: Some(BTreeSet::from([idle_core])),
        ..Default::default()
    };

    std::thread::scope(|scope| {
        let spun = scope.spawn(|| executor.execute(&spinner).unwrap());
        let slept = scope.spawn(|| executor.execute(&sleeper).unwrap());
        let spun = spun.join().unwrap();
        let slept = slept.join().unwrap();

        assert_eq!(spun.status, RunStatus::LimitExceeded);
        assert_eq!(slept.status, RunStatus::Exited);
        let spun_usage = spun.usage.expect("spinner measured");
        let slept_usage = slept.usage.expect("sleeper measured");
        assert!(
            spun_usage.cpu_time >= Duration::from_millis(500),
            "spinner barely ran: {:?}",
            spun_usage
        );
        assert!(
            slept_usage.cpu_time < Duration::from_millis(250),
            "sleeper charged with foreign cpu: {:?}",
            slept_usage
        );
    });
}

#[test]
fn one_core_pin_bounds_cpu_accumulation_rate() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let _gate = PIN_GATE.lock().unwrap();
    // Four spinners share a single core, so together they accumulate
    // CPU at one core's rate: a one second wall window yields roughly
    // one second of CPU, never four.
    let mut spec = sh("for i in 1 2 3 4; do (while :; do :; done) & done; wait");
    spec.limits = ResourceLimits {
        cores: Some(BTreeSet::from([0])),
        wall_time: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let result = executor.execute(&spec).unwrap();
    assert_eq!(result.status, RunStatus::LimitExceeded);
    assert_eq!(result.limit, Some(LimitKind::Wall));
    let usage = result.usage.expect("counters outlive the kill");
    assert!(
        usage.cpu_time >= Duration::from_millis(300),
        "spinners never got the core: {:?}",
        usage
    );
    assert!(
        usage.cpu_time <= Duration::from_millis(2500),
        "cpu accumulated faster than one core allows: {:?}",
        usage
    );
}

#[test]
fn cancellation_stops_the_run_early() {
    let Some(executor) = limited_executor() else {
        return;
    };
    let token = CancelToken::new();
    let spec = sh("sleep 60");

    std::thread::scope(|scope| {
        let canceller = token.clone();
        scope.spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            canceller.cancel();
        });
        let result = executor.execute_with_token(&spec, token.clone()).unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.termination_reason(), Some("killed"));
        assert!(result.wall_time < Duration::from_secs(30));
    });
}
