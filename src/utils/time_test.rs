use std::time::Duration;

use super::time::now_ms;

#[test]
fn test_now_ms_is_wall_clock_millis() {
    let before = now_ms();
    std::thread::sleep(Duration::from_millis(5));
    let after = now_ms();

    assert!(after >= before + 5);
    // Later than 2020-01-01
    assert!(before > 1_577_836_800_000);
}
