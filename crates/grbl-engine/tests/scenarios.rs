//! End-to-end scenarios driven against `LoopbackTransport`, one per literal
//! example in the design's testable-properties section.

use std::sync::Arc;
use std::time::Duration;

use grbl_core::persistence::MemorySink;
use grbl_core::{Coordinates, JobOptions, JobState, JobStatus, MachineState, Position, SoftLimits, SpeedLimits};
use grbl_engine::{
    Controller, ControllerConfig, JobRunner, JobRunnerConfig, LoopbackTransport, ProtocolCodec,
    SafetyValidator, ValidationOutcome,
};

async fn connected() -> (Controller, Arc<LoopbackTransport>) {
    let transport = LoopbackTransport::new();
    let controller = Controller::new(transport.clone(), ControllerConfig::default());
    controller.connect().await.unwrap();
    (controller, transport)
}

/// Scenario 1: status decode.
#[test]
fn status_decode() {
    let status = ProtocolCodec::parse_status("<Idle|MPos:1.5,-2.0,3.25|F:0>").unwrap();
    assert_eq!(status.state, MachineState::Idle);
    assert_eq!(status.machine_position, Some(Position::new(1.5, -2.0, 3.25)));
    assert_eq!(status.feed_rate, Some(0.0));
}

/// Scenario 2: safety reject.
#[test]
fn safety_reject() {
    let limits = SoftLimits::default();
    let speed = SpeedLimits::default();

    let outcome = SafetyValidator::validate("G0 X1000 Y1000", &limits, &speed, Position::ORIGIN);
    assert!(matches!(outcome, ValidationOutcome::Invalid(_)));

    let outcome = SafetyValidator::validate("G1 X10 F5000", &limits, &speed, Position::ORIGIN);
    assert!(matches!(outcome, ValidationOutcome::Invalid(_)));
}

/// Scenario 3: alarm flow.
#[tokio::test]
async fn alarm_flow() {
    let (controller, transport) = connected().await;
    let mut events = controller.events().subscribe_broadcast();

    let transport_clone = transport.clone();
    tokio::spawn(async move {
        transport_clone.push_line("ALARM:1").await;
    });
    controller.send("$X", None).await.unwrap();

    assert_eq!(controller.last_alarm_code().await, Some(1));

    loop {
        match events.recv().await.unwrap() {
            grbl_engine::HostEvent::Alarm(alarm) => {
                assert_eq!(alarm.code, 1);
                assert!(alarm.message.to_ascii_lowercase().contains("hard limit"));
                break;
            }
            _ => continue,
        }
    }
}

/// Scenario 4: probe parse.
#[test]
fn probe_parse() {
    let probe = ProtocolCodec::parse_probe("[PRB:0.000,0.000,-1.234:1]").unwrap();
    assert!(probe.contact);
    assert_eq!(probe.position, Position::new(0.0, 0.0, -1.234));
}

/// Scenario 5: jog and account.
#[tokio::test]
async fn jog_and_account() {
    let (controller, transport) = connected().await;

    let transport_clone = transport.clone();
    tokio::spawn(async move {
        transport_clone.push_line("<Idle|MPos:0,0,0>").await;
    });
    controller.get_status().await.unwrap();

    let transport_clone = transport.clone();
    tokio::spawn(async move {
        transport_clone.push_line("ok").await;
    });
    let delta = Coordinates {
        x: Some(10.0),
        y: Some(-5.0),
        ..Default::default()
    };
    let result = controller.jog(delta, 1000.0).await;
    assert!(result.success, "{result:?}");

    assert_eq!(controller.expected_position().await, Position::new(10.0, -5.0, 0.0));

    let written = transport.written().await;
    let last = written.last().unwrap();
    assert_eq!(std::str::from_utf8(last).unwrap(), "$J=G91 X10 Y-5 F1000\n");
}

/// Scenario 6: job fail + resume.
#[tokio::test]
async fn job_fail_and_resume() {
    let (controller, transport) = connected().await;
    let sink = Arc::new(MemorySink::default());
    let runner = JobRunner::new(controller.clone(), JobRunnerConfig::default(), sink.clone());

    let id = runner
        .load_job(
            "square.nc".to_string(),
            "G0 X10 Y10\nG1 Z-5 F100\nG0 X0 Y0".to_string(),
            JobOptions {
                stop_on_error: true,
                ..JobOptions::default()
            },
            true,
        )
        .await
        .unwrap();

    // Preamble (4 ok) + block 1 ok, then the transport goes silent so
    // block 2's send times out and the job fails with one block executed.
    let transport_clone = transport.clone();
    tokio::spawn(async move {
        for _ in 0..5 {
            transport_clone.push_line("ok").await;
            tokio::task::yield_now().await;
        }
    });

    runner.start_job(&id).await.unwrap();

    let failed = loop {
        if let Some(job) = runner.get_job_history().await.into_iter().find(|j| j.id == id) {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.execution_result.as_ref().unwrap().stats.blocks_executed, 1);

    sink.save(
        grbl_core::persistence::SnapshotKind::Autosave,
        &JobState {
            job_id: id.clone(),
            progress_percent: failed.progress_percent,
            status: JobStatus::Failed,
            paused: false,
            last_known_position: None,
            paused_position: Some(Position::ORIGIN),
            stats: failed.execution_result.as_ref().unwrap().stats,
            blocks_executed: failed.execution_result.as_ref().unwrap().stats.blocks_executed,
            saved_at_ms: 0,
        },
    )
    .await
    .unwrap();

    let transport_clone = transport.clone();
    tokio::spawn(async move {
        // recovery moves (raise, $X, move-over, descend) + remaining blocks
        for _ in 0..6 {
            transport_clone.push_line("ok").await;
            tokio::task::yield_now().await;
        }
    });

    runner.resume_after_crash(&id).await.unwrap();

    for _ in 0..200 {
        if let Some(job) = runner.get_job_history().await.into_iter().find(|j| j.id == id) {
            if job.status == JobStatus::Completed {
                assert_eq!(job.execution_result.as_ref().unwrap().stats.blocks_executed, 3);
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job did not resume to completion");
}

/// Scenario 6 (device-rejected block, the literal case): the device itself
/// answers block 2 with `error:`, not silence — this must fail the job
/// exactly like a timeout would, rather than being swallowed as a success.
#[tokio::test]
async fn job_fails_on_device_error_line() {
    let (controller, transport) = connected().await;
    let sink = Arc::new(MemorySink::default());
    let runner = JobRunner::new(controller.clone(), JobRunnerConfig::default(), sink.clone());

    let id = runner
        .load_job(
            "square.nc".to_string(),
            "G0 X10 Y10\nG1 Z-5 F100\nG0 X0 Y0".to_string(),
            JobOptions {
                stop_on_error: true,
                ..JobOptions::default()
            },
            true,
        )
        .await
        .unwrap();

    // Preamble (4 ok) + block 1 ok, then the device rejects block 2 with an
    // `error:` line instead of going silent.
    let transport_clone = transport.clone();
    tokio::spawn(async move {
        for _ in 0..5 {
            transport_clone.push_line("ok").await;
            tokio::task::yield_now().await;
        }
        transport_clone.push_line("error:2").await;
    });

    runner.start_job(&id).await.unwrap();

    let failed = loop {
        if let Some(job) = runner.get_job_history().await.into_iter().find(|j| j.id == id) {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.execution_result.as_ref().unwrap().stats.blocks_executed, 1);
}
