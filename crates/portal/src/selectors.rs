//! CSS selectors and text markers of the portal's markup.
//!
//! Everything scraped from the page is named here so a portal redesign is an
//! edit to this file alone.

// Login page.
pub const LOGIN_ID: &str = "#login_id";
pub const LOGIN_PASSWORD: &str = "#login_pw";
pub const LOGIN_BUTTON: &str = r#"button[login-role="login-button"]"#;

// Downline sales page.
pub const DATE_FROM: &str = "#__fromDate__";
pub const DATE_TO: &str = "#__toDate__";
pub const SEARCH_BUTTON: &str = r#"button[calendar-role="search"]"#;
/// Preset that selects days 1 to 15 of the current month.
pub const FIRST_HALF_BUTTON: &str = r#"button[calendar-period="before"]"#;
/// Preset that selects day 16 to the end of the current month.
pub const SECOND_HALF_BUTTON: &str = r#"button[calendar-period="current"]"#;
pub const LEFT_PV: &str = "#llnSumPv";
pub const RIGHT_PV: &str = "#rlnSumPv";

// Allowance page.
pub const ACHIEVEMENT_TABLE: &str = "#paging-list .tbl-lst tbody";
pub const ACHIEVEMENT_ROWS: &str = "#paging-list .tbl-lst tbody tr";
pub const DATE_CELL: &str = "td:first-child .date";
pub const STATUS_CELL: &str = "td:last-child .ctx";

/// Status cell text of a row that did not reach the bonus rank.
pub const NOT_ACHIEVED: &str = "未達";
