mod worker_process_tests;
