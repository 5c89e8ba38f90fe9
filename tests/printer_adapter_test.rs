use std::sync::Arc;

use printassist_core::adapter::{
    PrinterAdapter, ResolvedEntities, StaticSignalSource, STATUS_FINISH, STATUS_IDLE, STATUS_RUNNING,
};
use printassist_core::config::StoreConfig;
use printassist_core::model::{JobStatus, Plate};
use printassist_core::store::Store;

mod common;
use common::test_clock;

fn device_entities() -> ResolvedEntities {
    ResolvedEntities {
        status_entity: Some("sensor.bambu_print_status".to_string()),
        end_time_entity: Some("sensor.bambu_end_time".to_string()),
        task_name_entity: Some("sensor.bambu_task_name".to_string()),
        gcode_filename_entity: Some("sensor.bambu_gcode_filename".to_string()),
    }
}

#[tokio::test]
async fn printer_going_idle_to_running_autostarts_matching_job() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        snapshot_path: dir.path().join("store.json"),
    };
    let clock = test_clock(2024, 3, 1, 9, 0, 0);
    let store = Arc::new(Store::open(config, clock.clone()).await.unwrap());

    let project = store.create_project("Vase", "").await.unwrap();
    let plate = Plate::create(
        project.id,
        "spiral_vase_PETG_3h00m.gcode.3mf",
        1,
        "Spiral Vase",
        "h",
        10800,
        None,
        1,
    );
    store.add_plates(vec![plate.clone()]).await.unwrap();

    let source = Arc::new(StaticSignalSource::new(device_entities()));
    source.set("sensor.bambu_print_status", STATUS_IDLE).await;
    source
        .set("sensor.bambu_task_name", "spiral_vase_PETG_3h00m.gcode.3mf")
        .await;

    let adapter = Arc::new(PrinterAdapter::new(
        "printer-1",
        source.clone(),
        store.clone(),
        clock,
        3600,
        || {},
    ));
    assert!(adapter.setup().await);

    source.set("sensor.bambu_print_status", STATUS_RUNNING).await;
    // Give the spawned listener a moment to process the pushed event.
    adapter.spawn_listener();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let active = store.get_active_job().await.expect("job auto-started");
    assert_eq!(active.plate_id, plate.id);
    assert_eq!(active.status, JobStatus::Printing);

    // Teardown does not depend on anyone having kept the returned JoinHandle.
    adapter.shutdown();
}

#[tokio::test]
async fn printer_finishing_with_no_match_just_clears_unknown_print() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        snapshot_path: dir.path().join("store.json"),
    };
    let clock = test_clock(2024, 3, 1, 9, 0, 0);
    let store = Arc::new(Store::open(config, clock.clone()).await.unwrap());

    let source = Arc::new(StaticSignalSource::new(device_entities()));
    source.set("sensor.bambu_print_status", STATUS_IDLE).await;
    source
        .set("sensor.bambu_task_name", "someone_elses_manual_print.gcode")
        .await;

    let adapter = Arc::new(PrinterAdapter::new(
        "printer-1",
        source.clone(),
        store.clone(),
        clock,
        3600,
        || {},
    ));
    assert!(adapter.setup().await);

    adapter.spawn_listener();
    source.set("sensor.bambu_print_status", STATUS_RUNNING).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(adapter.get_blocking_end_time().await.is_some());
    assert!(store.get_active_job().await.is_none());

    source.set("sensor.bambu_print_status", STATUS_FINISH).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(adapter.get_blocking_end_time().await.is_none());
    adapter.shutdown();
}
