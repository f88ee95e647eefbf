/// Process façade and request contexts
pub mod process;

/// Runtime interface for external systems
pub mod runtime_interface;
