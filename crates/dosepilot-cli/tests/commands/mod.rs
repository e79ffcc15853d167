mod config_test;
mod simulate_test;
