mod controller_tests;
mod race_tests;
