mod aggregates;
mod orgs;

pub use aggregates::*;
pub use orgs::*;
