mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn test_create_plans_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("installments"));
    cmd.env_remove("INSTALLMENTS_DB_PATH")
        .arg("create-plans")
        .arg("tests/fixtures/orders.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("record,order_id,plan_id,outcome"))
        .stdout(predicate::str::contains("1,1001,1,created"))
        .stdout(predicate::str::contains("2,1002,,below_threshold"))
        .stdout(predicate::str::contains("3,1003,2,created"))
        // the same order twice in one batch
        .stdout(predicate::str::contains("4,1001,1,existing"));

    Ok(())
}

#[test]
fn test_bad_rows_do_not_stop_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("orders.csv");
    common::write_orders_csv(
        &input,
        &[
            (2001, 1, "not_a_number"),
            (2002, 0, "150.00"),
            (2003, 3, "150.00"),
        ],
    )
    .unwrap();

    let mut cmd = Command::new(cargo_bin!("installments"));
    cmd.env_remove("INSTALLMENTS_DB_PATH")
        .arg("create-plans")
        .arg(&input);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Unreadable order row"))
        .stdout(predicate::str::contains("\n1,,,error\n"))
        .stdout(predicate::str::contains("\n2,2002,,error\n"))
        .stdout(predicate::str::contains("\n3,2003,1,created\n"));
}

#[test]
fn test_custom_policy_flags() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("orders.csv");
    common::write_orders_csv(&input, &[(3001, 1, "60.00"), (3002, 1, "40.00")]).unwrap();

    let mut cmd = Command::new(cargo_bin!("installments"));
    cmd.env_remove("INSTALLMENTS_DB_PATH")
        .arg("create-plans")
        .arg(&input)
        .arg("--min-total")
        .arg("50")
        .arg("--installments")
        .arg("4");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("1,3001,1,created"))
        .stdout(predicate::str::contains("2,3002,,below_threshold"));
}

#[test]
fn test_zero_installments_is_rejected() {
    let mut cmd = Command::new(cargo_bin!("installments"));
    cmd.arg("create-plans")
        .arg("tests/fixtures/orders.csv")
        .arg("--installments")
        .arg("0");

    cmd.assert().failure();
}

#[test]
fn test_run_on_empty_store_reports_nothing_due() {
    let mut cmd = Command::new(cargo_bin!("installments"));
    cmd.env_remove("INSTALLMENTS_DB_PATH")
        .arg("run")
        .arg("--processor-url")
        .arg("http://127.0.0.1:9")
        .arg("--processor-key")
        .arg("sk_test_dummy");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("examined=0 paid=0"))
        .stdout(predicate::str::contains("cancelled=false"));
}

#[test]
fn test_run_requires_processor() {
    let mut cmd = Command::new(cargo_bin!("installments"));
    cmd.env_remove("INSTALLMENTS_PROCESSOR_URL")
        .env_remove("INSTALLMENTS_PROCESSOR_KEY")
        .arg("run");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--processor-url"));
}
