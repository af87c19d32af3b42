mod common;

use std::error::Error;
use std::fs;

use stagehand::bundler::Bundler;
use stagehand::config::model::BundleSection;
use stagehand::job::{Job, JobReport};
use stagehand::queue::QueueState;
use stagehand::tick_cycle;

use common::{FakeQueue, StageOpts, build_stage, exports};

type TestResult = Result<(), Box<dyn Error>>;

/// The canonical two-stage pipeline: an scf run on 16 nodes producing a
/// trial wavefunction on channel `k0`, and a dmc run consuming it. Driven
/// through whole tick cycles exactly as the polling loop does.
#[test]
fn two_stage_pipeline_runs_to_completion_across_tick_cycles() -> TestResult {
    let dir = tempfile::tempdir()?;

    let scf = build_stage(
        dir.path(),
        "scf",
        StageOpts {
            nodes: 16,
            exports: exports(&[("k0", &["qw_0.sys"])]),
            ..Default::default()
        },
    )?;
    let dmc = build_stage(
        dir.path(),
        "dmc",
        StageOpts {
            nodes: 4,
            needs: vec![stagehand::stage::roles::Need {
                producer: "scf".into(),
                channel: "k0".into(),
            }],
            ..Default::default()
        },
    )?;

    let queue = FakeQueue::default();
    let mut bundler = Bundler::new(
        BundleSection {
            capacity_nodes: 10,
            script_dir: dir.path().display().to_string(),
            ..Default::default()
        },
        Box::new(queue.clone()),
    );
    let mut jobs = vec![Job::new(
        "si",
        vec![Box::new(scf.stage), Box::new(dmc.stage)],
        3,
    )];

    // Cycle 1: scf writes its input and is submitted (oversized, alone);
    // dmc is blocked and untouched.
    tick_cycle(&mut jobs, &mut bundler)?;
    {
        let stages = jobs[0].stages();
        assert_eq!(stages[0].record().queue_ids, vec!["1".to_string()]);
        assert!(stages[0].record().writer_done);
        assert!(!stages[1].record().writer_done);
    }
    assert_eq!(queue.submissions.borrow().len(), 1);
    assert_eq!(jobs[0].report(), JobReport::NotFinished);

    // Cycles 2-3: the queue reports the run alive; nothing changes.
    *scf.queue_state.borrow_mut() = QueueState::Running;
    tick_cycle(&mut jobs, &mut bundler)?;
    tick_cycle(&mut jobs, &mut bundler)?;
    assert_eq!(*scf.writes.borrow(), 1);
    assert!(!jobs[0].stages()[1].record().writer_done);
    assert_eq!(queue.submissions.borrow().len(), 1);

    // The run finishes: queue forgets it, output lands with the marker.
    *scf.queue_state.borrow_mut() = QueueState::Unknown;
    common::finish_run(&scf.workdir, &scf.output_file);

    // Cycle 4: scf collects, dmc pulls the wavefunction in the same cycle,
    // writes its input, and is submitted.
    tick_cycle(&mut jobs, &mut bundler)?;
    {
        let stages = jobs[0].stages();
        assert!(stages[0].record().completed());
        assert!(stages[1].record().writer_done);
        assert_eq!(stages[1].record().queue_ids, vec!["2".to_string()]);
    }
    assert_eq!(*dmc.writes.borrow(), 1);

    // The pulled artifact path landed in dmc's input.
    let dmc_input = fs::read_to_string(dmc.workdir.join("dmc.in"))?;
    assert!(dmc_input.contains(&scf.workdir.join("qw_0.sys").display().to_string()));

    // dmc finishes; the job converges.
    common::finish_run(&dmc.workdir, &dmc.output_file);
    tick_cycle(&mut jobs, &mut bundler)?;
    assert_eq!(jobs[0].report(), JobReport::Ok);

    Ok(())
}

/// Checkpoint writes failing mid-cycle (scratch purge, quota) must leave the
/// driver cycling, not abort it halfway through a queue-id broadcast.
#[test]
fn checkpoint_write_failure_is_retried_instead_of_aborting() -> TestResult {
    let dir = tempfile::tempdir()?;

    let scf = build_stage(dir.path(), "scf", StageOpts::default())?;
    let workdir = scf.workdir.clone();

    let queue = FakeQueue::default();
    *queue.fail.borrow_mut() = true;
    let mut bundler = Bundler::new(
        BundleSection {
            script_dir: dir.path().display().to_string(),
            ..Default::default()
        },
        Box::new(queue.clone()),
    );
    let mut jobs = vec![Job::new("si", vec![Box::new(scf.stage)], 3)];

    // Queue down: the stage stays staged, nothing recorded.
    tick_cycle(&mut jobs, &mut bundler)?;
    assert!(jobs[0].stages()[0].record().queue_ids.is_empty());

    // The working directory vanishes, so every checkpoint write now fails.
    fs::remove_dir_all(&workdir)?;
    *queue.fail.borrow_mut() = false;

    // Both the tick and the id broadcast hit artifact I/O errors; the cycle
    // must still return cleanly so the next poll can retry.
    tick_cycle(&mut jobs, &mut bundler)?;
    assert!(tick_cycle(&mut jobs, &mut bundler).is_ok());

    Ok(())
}

/// A stage that keeps getting killed drags the whole job to `Failed`, while
/// its sibling still completes.
#[test]
fn repeatedly_killed_stage_fails_the_job_after_its_budget() -> TestResult {
    let dir = tempfile::tempdir()?;

    let scf = build_stage(dir.path(), "scf", StageOpts::default())?;
    let dmc = build_stage(dir.path(), "dmc", StageOpts::default())?;

    let queue = FakeQueue::default();
    let mut bundler = Bundler::new(
        BundleSection {
            script_dir: dir.path().display().to_string(),
            ..Default::default()
        },
        Box::new(queue.clone()),
    );
    let mut jobs = vec![Job::new(
        "si",
        vec![Box::new(scf.stage), Box::new(dmc.stage)],
        1,
    )];

    common::finish_run(&scf.workdir, &scf.output_file);
    common::kill_run(&dmc.workdir, &dmc.output_file);
    tick_cycle(&mut jobs, &mut bundler)?;
    assert_eq!(jobs[0].report(), JobReport::NotFinished);

    // Second kill exhausts the budget of 1.
    tick_cycle(&mut jobs, &mut bundler)?;
    common::kill_run(&dmc.workdir, &dmc.output_file);
    tick_cycle(&mut jobs, &mut bundler)?;

    assert_eq!(jobs[0].report(), JobReport::Failed);
    assert!(jobs[0].stages()[0].record().completed());
    assert!(jobs[0].stages()[1].record().failed);

    Ok(())
}
