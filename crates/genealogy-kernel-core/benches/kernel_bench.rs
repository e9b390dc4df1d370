use criterion::{criterion_group, criterion_main, Criterion};
use genealogy_kernel_core::{
    FourVector, GenealogyKernel, KernelConfig, PrimaryProvenance, StepPoint, StepRecord,
    TrackCreation, TrackEnd, TruthRecord, Vector3,
};

fn mk_truth() -> Vec<TruthRecord> {
    vec![TruthRecord { generator: "bench_generator".to_string(), particle_count: 1 }]
}

fn mk_primary(track_id: i32) -> TrackCreation {
    TrackCreation {
        track_id,
        parent_id: 0,
        pdg_code: 13,
        process: String::new(),
        kinetic_energy: 1.0,
        mass: 0.105_7,
        polarization: Vector3 { x: 0.0, y: 0.0, z: 0.0 },
        proper_time: 0.0,
        primary: Some(PrimaryProvenance {
            truth_index: 0,
            generated_index: 0,
            process: "primary".to_string(),
        }),
    }
}

fn mk_secondary(track_id: i32, parent_id: i32, process: &str) -> TrackCreation {
    TrackCreation {
        track_id,
        parent_id,
        pdg_code: 11,
        process: process.to_string(),
        kinetic_energy: 0.05,
        mass: 0.000_511,
        polarization: Vector3 { x: 0.0, y: 0.0, z: 0.0 },
        proper_time: 0.0,
        primary: None,
    }
}

fn mk_step(from: f64, to: f64, process: &str) -> StepRecord {
    StepRecord {
        pre: StepPoint {
            position: FourVector { x: from, y: 0.0, z: 0.0, t: from },
            momentum: FourVector { x: 1.0, y: 0.0, z: 0.0, t: 1.0 },
        },
        post: StepPoint {
            position: FourVector { x: to, y: 0.0, z: 0.0, t: to },
            momentum: FourVector { x: 1.0, y: 0.0, z: 0.0, t: 1.0 },
        },
        process: Some(process.to_string()),
        step_limited: false,
        step_length: to - from,
        time_delta: to - from,
        velocity: 1.0,
    }
}

fn mk_end(x: f64) -> TrackEnd {
    TrackEnd {
        final_point: StepPoint {
            position: FourVector { x, y: 0.0, z: 0.0, t: x },
            momentum: FourVector { x: 0.0, y: 0.0, z: 0.0, t: 0.0 },
        },
        process: Some("Decay".to_string()),
        weight: 1.0,
    }
}

fn drive_event(kernel: &mut GenealogyKernel, truth: &[TruthRecord], secondaries: i32) {
    kernel.begin_session(truth);
    if let Err(err) = kernel.admit(&mk_primary(1)) {
        panic!("benchmark primary admission failed: {err}");
    }
    for step in 0..20 {
        kernel.step(&mk_step(f64::from(step), f64::from(step) + 1.0, "muIoni"));
    }
    kernel.end_track(&mk_end(20.0));

    for index in 0..secondaries {
        let track_id = index + 2;
        if let Err(err) = kernel.admit(&mk_secondary(track_id, 1, "eBrem")) {
            panic!("benchmark secondary admission failed: {err}");
        }
        kernel.step(&mk_step(0.0, 0.5, "eIoni"));
        kernel.end_track(&mk_end(0.5));
    }

    if let Err(err) = kernel.finalize(truth) {
        panic!("benchmark finalization failed: {err}");
    }
}

fn bench_retain_all(c: &mut Criterion) {
    let truth = mk_truth();
    c.bench_function("event_1000_retained_secondaries", |b| {
        let mut kernel = GenealogyKernel::new(KernelConfig::default());
        b.iter(|| drive_event(&mut kernel, &truth, 1_000));
    });
}

fn bench_shower_suppression(c: &mut Criterion) {
    let truth = mk_truth();
    c.bench_function("event_1000_suppressed_secondaries", |b| {
        let mut kernel = GenealogyKernel::new(KernelConfig {
            keep_em_shower_daughters: false,
            ..KernelConfig::default()
        });
        b.iter(|| drive_event(&mut kernel, &truth, 1_000));
    });
}

criterion_group!(kernel_benches, bench_retain_all, bench_shower_suppression);
criterion_main!(kernel_benches);
