//! End-to-end configuration loading: file on disk through to a populated
//! board registry.

use std::io::Write;

use boardd_server::config;
use boardd_server::device::Registry;

const LAB_CONFIG: &str = r#"
[[boards]]
board = "db410c-01"
name = "DragonBoard 410c #1"
description = "96boards CE"
console = "/dev/ttyUSB3"
users = ["alice", "bob"]
boot_key_timeout = 5

[boards.gpio]
power = { line = 17 }
boot_key = { line = 22, active_low = true }

[[boards.boot_stages]]
kind = "dfu"

[[boards]]
board = "racked-01"
conmux = "racked-01-console"
"#;

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp config");
    file.write_all(text.as_bytes()).expect("write config");
    file.flush().expect("flush config");
    file
}

#[test]
fn test_config_file_populates_registry() {
    let file = write_config(LAB_CONFIG);
    let config = config::load(Some(file.path())).expect("config must parse");
    let registry = Registry::from_config(config);

    let board = registry.find("db410c-01").expect("board must be present");
    let board = board.borrow();
    assert_eq!(board.label(), "DragonBoard 410c #1");
    assert!(board.accessible(Some("alice")));
    assert!(!board.accessible(None), "access list must exclude anonymous");

    let racked = registry.find("racked-01").expect("conmux board present");
    assert!(racked.borrow().accessible(None), "no access list means open");
}

#[test]
fn test_invalid_board_is_rejected_at_load() {
    let file = write_config(
        r#"
        [[boards]]
        board = "broken"
        conmux = "svc"
        [boards.gpio]
        power = { line = 1 }
        "#,
    );
    assert!(config::load(Some(file.path())).is_err());
}

#[test]
fn test_parse_error_names_the_file() {
    let file = write_config("this is not toml [");
    let err = config::load(Some(file.path())).expect_err("must fail");
    assert!(err.to_string().contains("failed to parse"));
}
