mod batch_properties_tests;
mod dispatch_scenarios_tests;
mod e2b_dispatch_tests;
