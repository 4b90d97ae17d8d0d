pub mod kill_log;
