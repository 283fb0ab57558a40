use wattbench::persistence::CalibrationStore;
use wattbench::types::Calibration;

#[test]
fn missing_file_loads_as_uncalibrated() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path().join("calibration.yaml"));
    assert!(store.load().unwrap().is_none());
}

#[test]
fn save_then_load_returns_the_identical_pair() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path().join("calibration.yaml"));

    let cal = Calibration {
        k: 0.012345678901234,
        m: -0.98765432109876,
    };
    store.save(cal).unwrap();
    assert_eq!(store.load().unwrap(), Some(cal));
}

#[test]
fn save_overwrites_previous_coefficients() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path().join("calibration.yaml"));

    store.save(Calibration { k: 0.01, m: 0.2 }).unwrap();
    let newer = Calibration { k: 0.02, m: 0.1 };
    store.save(newer).unwrap();
    assert_eq!(store.load().unwrap(), Some(newer));
}

#[test]
fn save_creates_missing_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::new(dir.path().join("nested/state/calibration.yaml"));

    store.save(Calibration { k: 0.5, m: 0.0 }).unwrap();
    assert!(store.path().exists());
    assert!(store.load().unwrap().is_some());
}

#[test]
fn null_record_loads_as_uncalibrated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.yaml");
    std::fs::write(&path, "k: null\nm: null\n").unwrap();

    let store = CalibrationStore::new(&path);
    assert!(store.load().unwrap().is_none());
}

#[test]
fn malformed_record_is_a_serialization_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.yaml");
    std::fs::write(&path, "k: [not, a, number]\n").unwrap();

    let store = CalibrationStore::new(&path);
    assert!(store.load().is_err());
}
