//! Constants used throughout the KIA core crate.
//!
//! Clinical thresholds, paging defaults and journal layout names live here so that the
//! services and the binaries agree on them.

/// Age in months at which the basic immunization schedule must be complete (MR1 eligibility).
pub const DEFAULT_IDL_COMPLETION_AGE_MONTHS: u32 = 9;

/// Upper bound (inclusive) of the immunization target population, in months.
pub const DEFAULT_TARGET_MAX_AGE_MONTHS: u32 = 18;

/// Average month length used for age-in-months arithmetic.
pub const DAYS_PER_MONTH: f64 = 30.44;

/// Naegele's rule: estimated delivery is 280 days after the last menstrual period.
pub const FULL_TERM_DAYS: i64 = 280;

/// An LMP older than this many weeks cannot describe an ongoing pregnancy.
pub const MAX_GESTATION_WEEKS: i64 = 45;

/// Trimester boundaries in completed gestational weeks.
pub const SECOND_TRIMESTER_FROM_WEEK: i64 = 14;
pub const THIRD_TRIMESTER_FROM_WEEK: i64 = 28;

/// Minimum plausible birth weight in grams.
pub const MIN_BIRTH_WEIGHT_G: u32 = 500;

/// Minimum plausible birth length in centimetres.
pub const MIN_BIRTH_LENGTH_CM: f64 = 20.0;

/// Default and maximum page sizes for list operations.
pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

/// Journal subdirectory names, one per record kind.
pub const PREGNANCIES_DIR_NAME: &str = "pregnancies";
pub const VISITS_DIR_NAME: &str = "visits";
pub const DELIVERIES_DIR_NAME: &str = "deliveries";
pub const IMMUNIZATIONS_DIR_NAME: &str = "immunizations";
pub const RESIDENTS_DIR_NAME: &str = "residents";
pub const EVENTS_DIR_NAME: &str = "events";

/// Worker events retained by the feed; older ones are dropped, journal files included.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 10_000;

/// Extension of journal record files.
pub const JOURNAL_EXTENSION: &str = "yaml";
