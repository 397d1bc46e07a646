mod blocklist;
mod quota;

pub use blocklist::Blocklist;
pub use quota::{Enforcement, QuotaManager};
