use assert_cmd::Command;
use lcg_lib::io::trace::{write_recording, AttrValue, Recording, RunInfo, SchemaVersion, TraceEntity};
use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::Value;
use std::{collections::BTreeMap, fs, path::Path};
use tempfile::tempdir;

const DT: f64 = 1e-4;

fn lcg(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("lcg").unwrap();
    cmd.current_dir(dir);
    cmd
}

fn stdout_json(cmd: &mut Command) -> Value {
    let assert = cmd.assert().success();
    serde_json::from_slice(&assert.get_output().stdout).unwrap()
}

/// Electrode of 0.96 mV/pA on top of a membrane decaying over 50 samples.
fn true_kernel() -> Vec<f64> {
    let mut kernel: Vec<f64> = (0..50).map(|n| 0.1 * (-(n as f64) / 50.0).exp()).collect();
    for (n, value) in [0.5, 0.3, 0.1, 0.05, 0.01].iter().enumerate() {
        kernel[n] += value;
    }
    kernel
}

/// White noise current and the voltage it produces through `true_kernel`.
fn noise_recording(samples: usize, segments: &[f64]) -> Recording {
    let mut rng = StdRng::seed_from_u64(42);
    let current: Vec<f64> = (0..samples).map(|_| rng.gen_range(-100.0..100.0)).collect();
    let kernel = true_kernel();
    let voltage: Vec<f64> = (0..samples)
        .map(|n| {
            -65.0
                + kernel
                    .iter()
                    .enumerate()
                    .take(n + 1)
                    .map(|(j, k)| k * current[n - j])
                    .sum::<f64>()
        })
        .collect();
    let mut waveform = TraceEntity::new(2, current);
    waveform.name = Some("Waveform".into());
    waveform.units = Some("pA".into());
    let rows: Vec<f64> = segments.iter().flat_map(|d| [*d, 1.0]).collect();
    waveform.metadata = Some(Array2::from_shape_vec((segments.len(), 2), rows).unwrap());
    let mut membrane = TraceEntity::new(1, voltage);
    membrane.name = Some("AnalogInput".into());
    membrane.units = Some("mV".into());
    Recording {
        entities: vec![membrane, waveform],
        info: RunInfo {
            dt: DT,
            tend: samples as f64 * DT,
            version: SchemaVersion::V2,
            extra: BTreeMap::from([(
                "startTimeSec".to_string(),
                AttrValue::Number(1_700_000_000.0),
            )]),
        },
    }
}

#[test]
fn trace_info_summarises_the_entities() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("run.h5");
    write_recording(&path, &noise_recording(2000, &[0.2])).unwrap();
    let info = stdout_json(lcg(temp.path()).args(&["trace-info", path.to_str().unwrap()]));
    assert_eq!(info["info"]["dt"].as_f64().unwrap(), DT);
    let entities = info["entities"].as_array().unwrap();
    assert_eq!(entities.len(), 2);
    assert_eq!(entities[0]["units"], "mV");
    assert_eq!(entities[0]["samples"], 2000);
    assert_eq!(entities[1]["name"], "Waveform");
    assert_eq!(entities[1]["metadata"], serde_json::json!([1, 2]));
}

#[test]
fn trace_info_counts_threshold_crossings() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("spikes.h5");
    let data: Vec<f64> = (0..1000)
        .map(|n| if n % 100 == 50 { 20.0 } else { -65.0 })
        .collect();
    let mut voltage = TraceEntity::new(1, data);
    voltage.units = Some("mV".into());
    let recording = Recording {
        entities: vec![voltage],
        info: RunInfo {
            dt: 1e-3,
            tend: 1.0,
            version: SchemaVersion::V2,
            extra: BTreeMap::new(),
        },
    };
    write_recording(&path, &recording).unwrap();
    let info = stdout_json(lcg(temp.path()).args(&[
        "trace-info",
        path.to_str().unwrap(),
        "--spike-threshold",
        "0",
    ]));
    let firing = &info["entities"][0]["firing"];
    assert_eq!(firing["count"], 10);
    assert!((firing["rate"].as_f64().unwrap() - 10.0).abs() < 1e-9);
}

#[test]
fn trace_info_fails_on_missing_files() {
    let temp = tempdir().unwrap();
    lcg(temp.path())
        .args(&["trace-info", "missing.h5"])
        .assert()
        .failure();
}

#[test]
fn kernel_recovers_the_electrode_resistance() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("noise.h5");
    write_recording(&path, &noise_recording(20000, &[2.0])).unwrap();
    let report = stdout_json(lcg(temp.path()).args(&[
        "kernel",
        path.to_str().unwrap(),
        "--tail-start",
        "20",
        "--interval",
        "0,2",
    ]));
    let resistance = report["resistance"].as_f64().unwrap();
    assert!((resistance - 960.0).abs() < 30.0, "R = {}", resistance);
    assert!((report["v0"].as_f64().unwrap() + 65.0).abs() < 1.0);

    let saved = fs::read_to_string(temp.path().join("noise_kernel.dat")).unwrap();
    let values: Vec<f64> = saved.lines().map(|l| l.trim().parse().unwrap()).collect();
    assert_eq!(values.len(), 20);
    assert!((values[0] - 5e8).abs() < 2.5e7, "Ke[0] = {}", values[0]);
}

#[test]
fn kernel_finds_the_noise_in_the_stimulus() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("protocol.h5");
    write_recording(&path, &noise_recording(70000, &[0.5, 6.0, 0.5])).unwrap();
    let out = temp.path().join("electrode.dat");
    let report = stdout_json(lcg(temp.path()).args(&[
        "kernel",
        path.to_str().unwrap(),
        "--tail-start",
        "20",
        "-o",
        out.to_str().unwrap(),
    ]));
    let resistance = report["resistance"].as_f64().unwrap();
    assert!((resistance - 960.0).abs() < 30.0, "R = {}", resistance);
    assert!(out.exists());
}

#[test]
fn kernel_needs_a_tail_start_on_closed_input() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("noise.h5");
    write_recording(&path, &noise_recording(20000, &[2.0])).unwrap();
    lcg(temp.path())
        .args(&["kernel", path.to_str().unwrap(), "--interval", "0,2"])
        .write_stdin("")
        .assert()
        .failure();
}
