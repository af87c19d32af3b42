mod common;

use std::cell::RefCell;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use stagehand::errors::OrchestratorError;
use stagehand::job::Job;
use stagehand::stage::lifecycle::Export;
use stagehand::stage::roles::Need;

use common::{StageOpts, build_stage, exports};

type TestResult = Result<(), Box<dyn Error>>;

fn need(producer: &str, channel: &str) -> Need {
    Need {
        producer: producer.into(),
        channel: channel.into(),
    }
}

/// Handles into the producer's fakes after the job takes ownership of it.
struct ProducerProbe {
    workdir: PathBuf,
    writes: Rc<RefCell<u32>>,
    polls: Rc<RefCell<u32>>,
}

impl ProducerProbe {
    fn finish_run(&self) {
        fs::write(self.workdir.join("scf.out"), "converged\nDONE\n").unwrap();
    }
}

/// Producer `scf` exporting channel `k0`, consumer `dmc` pulling it.
fn producer_consumer(root: &Path) -> Result<(Job, ProducerProbe), Box<dyn Error>> {
    let producer = build_stage(
        root,
        "scf",
        StageOpts {
            exports: exports(&[("k0", &["scf.chk"])]),
            ..Default::default()
        },
    )?;
    let consumer = build_stage(
        root,
        "dmc",
        StageOpts {
            needs: vec![need("scf", "k0")],
            ..Default::default()
        },
    )?;

    let probe = ProducerProbe {
        workdir: producer.workdir.clone(),
        writes: producer.writes.clone(),
        polls: producer.polls.clone(),
    };
    let job = Job::new(
        "si",
        vec![Box::new(producer.stage), Box::new(consumer.stage)],
        3,
    );
    Ok((job, probe))
}

#[test]
fn pulling_an_incomplete_producer_advances_it_exactly_one_hop() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (mut job, producer) = producer_consumer(dir.path())?;

    assert_eq!(job.pull(&need("scf", "k0"))?, Export::NotReady);
    assert_eq!(*producer.writes.borrow(), 1, "producer wrote its input");
    assert_eq!(*producer.polls.borrow(), 1, "one advance, one status poll");

    // Each pull is one more hop, never a cascade to completion.
    assert_eq!(job.pull(&need("scf", "k0"))?, Export::NotReady);
    assert_eq!(*producer.polls.borrow(), 2);
    assert_eq!(*producer.writes.borrow(), 1);

    Ok(())
}

#[test]
fn completed_producer_yields_a_stable_artifact_set() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (mut job, producer) = producer_consumer(dir.path())?;

    producer.finish_run();
    let first = job.pull(&need("scf", "k0"))?;
    let expected = vec![producer.workdir.join("scf.chk")];
    assert_eq!(first, Export::Ready(expected));

    // Completed producers are never advanced again; the paths never move.
    let polls = *producer.polls.borrow();
    for _ in 0..3 {
        assert_eq!(job.pull(&need("scf", "k0"))?, first);
    }
    assert_eq!(*producer.polls.borrow(), polls);

    Ok(())
}

#[test]
fn completed_producer_without_the_channel_is_a_hard_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (mut job, producer) = producer_consumer(dir.path())?;

    producer.finish_run();
    job.pull(&need("scf", "k0"))?;

    let err = job.pull(&need("scf", "nope")).expect_err("unknown channel");
    match err {
        OrchestratorError::MissingChannel { producer, channel } => {
            assert_eq!(producer, "scf");
            assert_eq!(channel, "nope");
        }
        other => panic!("expected MissingChannel, got {other:?}"),
    }

    Ok(())
}

#[test]
fn unknown_producer_is_a_hard_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (mut job, _) = producer_consumer(dir.path())?;

    let err = job.pull(&need("hf", "k0")).expect_err("no such stage");
    assert!(matches!(err, OrchestratorError::MissingChannel { .. }));

    Ok(())
}

#[test]
fn blocked_consumer_makes_no_progress_during_a_tick() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (mut job, producer) = producer_consumer(dir.path())?;

    job.tick()?;
    job.tick()?;

    // The producer moves; the consumer never writes input while blocked.
    assert_eq!(*producer.writes.borrow(), 1);
    let consumer = &job.stages()[1];
    assert_eq!(consumer.record().name, "dmc");
    assert!(!consumer.record().writer_done);

    Ok(())
}

#[test]
fn a_tick_advances_each_stage_at_most_once() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (mut job, producer) = producer_consumer(dir.path())?;

    // The producer is advanced by its own slot in the tick; the consumer's
    // pull in the same cycle must not advance it again.
    job.tick()?;
    assert_eq!(*producer.polls.borrow(), 1);

    job.tick()?;
    assert_eq!(*producer.polls.borrow(), 2);

    Ok(())
}
