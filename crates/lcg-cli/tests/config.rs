use assert_cmd::Command;
use serde_json::Value;
use std::{fs, path::Path};
use tempfile::tempdir;

const RIG: [(&str, &str); 14] = [
    ("SAMPLING_RATE", "20000"),
    ("AI_CHANNEL", "0"),
    ("AO_CHANNEL", "1"),
    ("AI_CONVERSION_FACTOR_CC", "100"),
    ("AI_CONVERSION_FACTOR_VC", "0.001"),
    ("AO_CONVERSION_FACTOR_CC", "0.0025"),
    ("AO_CONVERSION_FACTOR_VC", "20"),
    ("AI_UNITS_CC", "mV"),
    ("AI_UNITS_VC", "pA"),
    ("AO_UNITS_CC", "pA"),
    ("AO_UNITS_VC", "mV"),
    ("COMEDI_DEVICE", "/dev/comedi0"),
    ("AI_SUBDEVICE", "0"),
    ("AO_SUBDEVICE", "1"),
];

fn lcg(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("lcg").unwrap();
    cmd.current_dir(dir).envs(RIG);
    cmd
}

fn stdout_json(cmd: &mut Command) -> Value {
    let assert = cmd.assert().success();
    serde_json::from_slice(&assert.get_output().stdout).unwrap()
}

#[test]
fn write_config_uses_the_longest_stimulus() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("short.stim"), "1\t1\t0\n").unwrap();
    fs::write(temp.path().join("long.stim"), "1\t1\t0\n2\t1\t100\n").unwrap();
    let report = stdout_json(lcg(temp.path()).args(&[
        "write-config",
        "-I",
        "0-2",
        "-O",
        "0,1",
        "-s",
        "short.stim,long.stim",
        "--rt",
        "yes",
    ]));
    assert_eq!(report["inputs"], 3);
    assert_eq!(report["outputs"], 2);
    assert_eq!(report["duration"].as_f64().unwrap(), 3.0);
    let xml = fs::read_to_string(temp.path().join("lcg.xml")).unwrap();
    assert_eq!(xml.matches("<name>AnalogInput</name>").count(), 3);
    assert_eq!(xml.matches("<name>AnalogOutput</name>").count(), 2);
    assert!(xml.contains("<tend>3</tend>"));
}

#[test]
fn write_config_shares_a_single_stimulus() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("step.stim"), "0.25\t1\t50\n").unwrap();
    lcg(temp.path())
        .args(&[
            "write-config",
            "-O",
            "0,1",
            "-s",
            "step.stim",
            "--rt",
            "no",
            "-c",
            "shared.xml",
        ])
        .assert()
        .success();
    let xml = fs::read_to_string(temp.path().join("shared.xml")).unwrap();
    assert_eq!(xml.matches("<stimfile>step.stim</stimfile>").count(), 2);
}

#[test]
fn write_config_without_outputs_needs_a_duration() {
    let temp = tempdir().unwrap();
    lcg(temp.path())
        .args(&["write-config", "-O", "none"])
        .assert()
        .failure();
    let report = stdout_json(lcg(temp.path()).args(&["write-config", "-O", "none", "-l", "4.5"]));
    assert_eq!(report["duration"].as_f64().unwrap(), 4.5);
    assert_eq!(report["outputs"], 0);
}

#[test]
fn write_config_rejects_mismatched_stimulus_counts() {
    let temp = tempdir().unwrap();
    for name in ["a.stim", "b.stim"] {
        fs::write(temp.path().join(name), "1\t1\t0\n").unwrap();
    }
    lcg(temp.path())
        .args(&["write-config", "-O", "0-2", "-s", "a.stim,b.stim"])
        .assert()
        .failure();
}

#[test]
fn write_config_rejects_a_missing_device() {
    let temp = tempdir().unwrap();
    lcg(temp.path())
        .args(&["write-config", "-O", "none", "-l", "1", "-D", "/dev/no-such-board"])
        .assert()
        .failure();
}

#[test]
fn substitute_applies_rules_in_order() {
    let temp = tempdir().unwrap();
    let template = temp.path().join("template.xml");
    fs::write(&template, "<tend>TEND</tend>\n<f>F</f>\n").unwrap();
    let output = temp.path().join("out.xml");
    lcg(temp.path())
        .args(&[
            "substitute",
            template.to_str().unwrap(),
            output.to_str().unwrap(),
            "TEND=F0",
            "F=12",
        ])
        .assert()
        .success();
    assert_eq!(
        fs::read_to_string(&output).unwrap(),
        "<tend>120</tend>\n<f>12</f>\n"
    );
}

#[test]
fn substitute_searches_the_configurations_directory() {
    let temp = tempdir().unwrap();
    let configurations = temp.path().join("configurations");
    fs::create_dir(&configurations).unwrap();
    fs::write(configurations.join("fclamp.xml"), "<rate>RATE</rate>\n").unwrap();
    lcg(temp.path())
        .env("CONFIGURATIONS_PATH", &configurations)
        .args(&["substitute", "fclamp.xml", "out.xml", "RATE=20000"])
        .assert()
        .success();
    assert_eq!(
        fs::read_to_string(temp.path().join("out.xml")).unwrap(),
        "<rate>20000</rate>\n"
    );
    lcg(temp.path())
        .env("CONFIGURATIONS_PATH", &configurations)
        .args(&["substitute", "missing.xml", "out.xml"])
        .assert()
        .failure();
}

#[test]
fn noisy_background_balances_the_currents() {
    let temp = tempdir().unwrap();
    let report = stdout_json(lcg(temp.path()).args(&["noisy-bg", "--rm", "100"]));
    let ratio = report["ratio"].as_f64().unwrap();
    assert!(ratio > 0.0);
    assert!(report["coefficients"]["excitatory_mean"].as_f64().unwrap() > 0.0);
    let xml = fs::read_to_string(temp.path().join("ou.xml")).unwrap();
    assert!(xml.contains("<dynamicclamp>"));
    assert_eq!(xml.matches("<ou>").count(), 2);
}

#[test]
fn output_names_are_not_taken() {
    let temp = tempdir().unwrap();
    let assert = lcg(temp.path())
        .args(&["output-name", "cell", "h5"])
        .assert()
        .success();
    let name = String::from_utf8_lossy(&assert.get_output().stdout)
        .trim()
        .to_string();
    let file = Path::new(&name).file_name().unwrap().to_str().unwrap().to_string();
    assert!(file.starts_with("cell_"));
    assert!(file.ends_with(".h5"));
    assert!(!temp.path().join(&file).exists());
}
