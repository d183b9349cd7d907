pub fn prepare_test_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .filter_module("profidp::fdl", log::LevelFilter::Trace)
        .filter_module("profidp::dp", log::LevelFilter::Trace)
        .filter_module("profidp::phy", log::LevelFilter::Trace)
        .try_init();
}
