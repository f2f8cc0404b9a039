use std::fs;

use keel_config::load_config_from;
use keel_core::TradingMode;
use rust_decimal_macros::dec;

const DEFAULT: &str = r#"
mode = "paper"
database_path = "./data/test.db"

[orders]
entry_ttl_secs = 45

[orders.reposition]
step_bps = 10

[risk]
max_daily_notional = 1000

[market_data.focus]
default_symbols = ["XBTUSD", "ETHUSD"]
"#;

const STAGING: &str = r#"
[orders]
entry_ttl_secs = 30

[risk.breaker]
max_positions = 2
"#;

// One test owns the KEEL__ environment for this binary.
#[test]
fn files_and_environment_merge_in_precedence_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("default.toml"), DEFAULT)?;
    fs::write(dir.path().join("staging.toml"), STAGING)?;

    let base = load_config_from(dir.path(), None)?;
    assert_eq!(base.mode, TradingMode::Paper);
    assert_eq!(base.orders.entry_ttl_secs, 45);
    assert_eq!(base.orders.exit_ttl_secs, 20);
    assert_eq!(base.orders.reposition.step_bps, dec!(10));
    assert_eq!(base.orders.reposition.max_reprices, 3);
    assert_eq!(base.risk.max_daily_notional, Some(dec!(1000)));
    assert_eq!(base.market_data.focus.default_symbols, vec!["XBTUSD", "ETHUSD"]);
    assert_eq!(base.reconcile.tolerances.cash, dec!(1));

    let staged = load_config_from(dir.path(), Some("staging"))?;
    assert_eq!(staged.orders.entry_ttl_secs, 30);
    assert_eq!(staged.risk.breaker.max_positions, 2);
    assert_eq!(staged.reconcile_config().limits.max_open_positions, 2);

    fs::write(
        dir.path().join("local.toml"),
        "[reconcile]\nsafe_mode_cooldown_secs = 120\n",
    )?;
    std::env::set_var("KEEL__ORDERS__ENTRY_TTL_SECS", "15");
    std::env::set_var("KEEL__LIVE__INSTANCE_ID", "keel-env");
    let layered = load_config_from(dir.path(), Some("staging"));
    std::env::remove_var("KEEL__ORDERS__ENTRY_TTL_SECS");
    std::env::remove_var("KEEL__LIVE__INSTANCE_ID");
    let layered = layered?;
    assert_eq!(layered.orders.entry_ttl_secs, 15);
    assert_eq!(layered.live.instance_id, "keel-env");
    assert_eq!(layered.reconcile.safe_mode_cooldown_secs, 120);
    assert_eq!(layered.risk.breaker.max_positions, 2);
    Ok(())
}

#[test]
fn missing_default_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(load_config_from(dir.path(), None).is_err());
}
