pub mod octopus;

pub use octopus::OctopusSource;
