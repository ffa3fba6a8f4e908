//! Scenario tests driven by a host-side emulator driver.


mod device_pipeline;
mod device_pool;
