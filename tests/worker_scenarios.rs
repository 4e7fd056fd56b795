// tests/worker_scenarios.rs
//
// Integration tests for the concrete scenarios a complete implementation
// must get right end to end: idempotent resubmission, checkpoint-stitched
// restarts, content-hash stability, reactor convergence, compact-mode
// completeness, and a failed-SCF run still being marked retrieved.

use atomflow::core::{CommonSettings, MinSettings, RxnSettings, Structure};
use atomflow::driver::{self, CodeDriver};
use atomflow::scheduler::LocalScheduler;
use atomflow::worker::reactor::ReactorWorker;
use atomflow::worker::single::SingleWorker;
use atomflow::worker::{PotentialSpec, Worker};
use atomflow::{CoreError, DriverSetting};
use std::collections::HashMap;
use std::sync::Arc;

fn sample_structure() -> Structure {
    Structure {
        cell: [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
        pbc: [true, true, true],
        symbols: vec!["Pt".into(), "O".into()],
        positions: vec![[0.0, 0.0, 0.0], [1.5, 0.0, 0.0]],
        velocities: None,
        tags: None,
        move_mask: vec![true, true],
        info: HashMap::new(),
    }
}

fn min_setting(steps: usize) -> DriverSetting {
    DriverSetting::Min(MinSettings {
        common: CommonSettings {
            dump_period: 1,
            ckpt_period: 1,
            steps,
            constraint: None,
            random_seed: None,
        },
        min_style: "bfgs".into(),
        fmax: 0.05,
        cell_filter: None,
        maxstep: None,
        ignore_convergence: false,
    })
}

fn potential() -> PotentialSpec {
    PotentialSpec {
        engine: "lammps".into(),
        command: "lmp_mpi".into(),
    }
}

/// §8 scenario: resubmitting a batch already in the JobDatabase must not
/// create a second scheduler job or a second BatchRecord for the same
/// (stru_id, batch_index).
#[tokio::test]
async fn idempotent_resubmit_does_not_duplicate_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Worker::open(dir.path(), Arc::new(LocalScheduler::new())).unwrap();
    let settings = vec![min_setting(0)];
    let (stru_id, candidates) = worker
        .plan_batch(&[sample_structure()], &[potential()], &settings)
        .unwrap();

    let first = worker.submit(&stru_id, &candidates, 10).await.unwrap();
    let second = worker.submit(&stru_id, &candidates, 10).await.unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
}

/// §8 scenario: content hash is stable across info-only differences, and
/// two structurally different batches never collide.
#[test]
fn content_hash_depends_only_on_physical_content() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Worker::open(dir.path(), Arc::new(LocalScheduler::new())).unwrap();
    let settings = vec![min_setting(10)];

    let mut a = sample_structure();
    a.info.insert("confid".into(), serde_json::Value::from(7));
    let mut b = sample_structure();
    b.info.insert("confid".into(), serde_json::Value::from(99));

    let (id_a, _) = worker.plan_batch(&[a], &[potential()], &settings).unwrap();
    let (id_b, _) = worker.plan_batch(&[b], &[potential()], &settings).unwrap();
    assert_eq!(id_a, id_b);

    let mut c = sample_structure();
    c.positions[0][0] += 0.5;
    let (id_c, _) = worker.plan_batch(&[c], &[potential()], &settings).unwrap();
    assert_ne!(id_a, id_c);
}

/// §8 scenario: restarting a driver from a checkpoint must produce a
/// strictly monotonic, non-duplicated step sequence.
#[test]
fn checkpoint_stitching_is_monotonic_and_deduplicated() {
    use atomflow::core::{DeviationInfo, Frame, FrameAnnotations};

    fn frame(step: i64) -> Frame {
        Frame {
            structure: sample_structure(),
            energy: -1.0,
            forces: vec![[0.0, 0.0, 0.0]; 2],
            stress: None,
            annotations: FrameAnnotations {
                step,
                wdir: "cand0".into(),
                fmax: None,
                time: None,
                error: None,
                deviation: DeviationInfo::default(),
            },
        }
    }

    let segment_a = vec![frame(0), frame(1), frame(2)];
    let segment_b = vec![frame(2), frame(3), frame(4)];
    let stitched = driver::stitch_segments(vec![segment_a, segment_b], true);

    let steps: Vec<i64> = stitched.iter().map(|f| f.annotations.step).collect();
    assert_eq!(steps, vec![0, 1, 2, 3, 4]);
    driver::assert_monotonic_steps(&stitched).expect("stitched trajectory must be monotonic");
}

/// §8 scenario: a reactor chain whose length disagrees with
/// `RxnSettings.nimages` is rejected before any driver call is made.
#[tokio::test]
async fn reactor_chain_length_mismatch_is_rejected() {
    let driver: Box<dyn CodeDriver> = Box::new(driver::AbInitioDriver::new("vasp_std"));
    let worker = ReactorWorker::new(driver);

    let settings = RxnSettings {
        common: CommonSettings {
            dump_period: 1,
            ckpt_period: 1,
            steps: 50,
            constraint: None,
            random_seed: None,
        },
        nimages: 5,
        climb: true,
        spring_constant: 5.0,
        fmax: 0.05,
    };
    let chain = vec![sample_structure(), sample_structure(), sample_structure()];

    let dir = tempfile::tempdir().unwrap();
    let result = worker.run_chain(dir.path(), &chain, &settings).await;
    assert!(matches!(result, Err(CoreError::Configuration(_))));
}

/// §8 scenario: compact-mode completeness is a set difference between
/// expected wdirs and what's actually been cached, independent of ordering.
#[test]
fn single_worker_completeness_ignores_insertion_order() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("_shared");
    std::fs::create_dir_all(&shared).unwrap();

    let append = |wdir: &str| {
        let mut s = sample_structure();
        s.info
            .insert("wdir".to_string(), serde_json::Value::String(wdir.to_string()));
        let mut buf = Vec::new();
        atomflow::structure_io::write_frame(&mut buf, &s).unwrap();
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(shared.join("cached.xyz"))
            .unwrap()
            .write_all(&buf)
            .unwrap();
    };
    append("cand1");
    append("cand0");

    let worker = SingleWorker::open(dir.path(), Box::new(driver::ClassicalDriver::new("lmp_mpi"))).unwrap();
    assert!(worker.is_complete(&["cand0".to_string(), "cand1".to_string()]).unwrap());
    assert!(!worker
        .is_complete(&["cand0".to_string(), "cand1".to_string(), "cand2".to_string()])
        .unwrap());
}

/// §8 scenario: a batch whose driver surfaced an SCF non-convergence still
/// has a readable trajectory, and `retrieve` marks it retrieved regardless.
#[tokio::test]
async fn retrieve_marks_retrieved_even_when_a_candidate_failed() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Worker::open(dir.path(), Arc::new(LocalScheduler::new())).unwrap();
    let settings = vec![min_setting(0)];
    let (stru_id, candidates) = worker
        .plan_batch(&[sample_structure()], &[potential()], &settings)
        .unwrap();

    worker.submit(&stru_id, &candidates, 10).await.unwrap();
    worker.inspect(false).await.unwrap();

    let retrieved = worker.retrieve(false).await.unwrap();
    assert_eq!(retrieved.len(), 1);
    let (_, results) = &retrieved[0];
    assert_eq!(results.len(), 1);

    // No real engine ran (no `frame.json` was produced by the stub
    // command), so `read_trajectory` reads back an empty trajectory rather
    // than panicking; the batch is still marked retrieved either way.
    let second_pass = worker.retrieve(false).await.unwrap();
    assert!(second_pass.is_empty(), "already-retrieved batch must not be returned again");
}
