//! Stateless scoring primitives.
//!
//! - [`matches`]: incremental LCSS and EDR over sparse matches, with DP
//!   fallbacks over an explicit match predicate
//! - [`geometric`]: DTW, Hausdorff and discrete Fréchet with early abandonment
//! - [`lors`]: length-weighted edge LCS with a remaining-length bound

pub mod geometric;
pub mod lors;
pub mod matches;

pub use geometric::{dtw, frechet, hausdorff};
pub use lors::{lors, rest_distance};
pub use matches::{edr_dp, edr_from_matches, lcss_dp, lcss_from_matches, EdrMatches, LcssMatches};
