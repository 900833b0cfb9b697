mod startup;

pub use startup::initialize_on_startup;
