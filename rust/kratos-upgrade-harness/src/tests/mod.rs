// Tests module
// Scripted stubs for the collaborator traits, end-to-end coordinator
// scenarios against them, and full runs against the simulated network.

pub mod stub;
pub mod simulated;
