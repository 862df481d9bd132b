//! The protected calculator endpoints: typed payloads and prompt
//! construction.
//!
//! Each endpoint accepts a small JSON payload, validates it, and turns
//! it into a free-text prompt for the completion upstream. The endpoint
//! path doubles as the rate-limit scope key, so adding an endpoint here
//! automatically gives it its own counters (and, optionally, a policy
//! override in the config file).

use serde::Deserialize;

use crate::{GatewayError, Result};

/// Path of the salary comparison calculator.
pub const SALARY_COMPARISON: &str = "/api/salary-comparison";

/// Path of the career roadmap generator.
pub const CAREER_ROADMAP: &str = "/api/career-roadmap";

/// Path of the retirement readiness calculator.
pub const RETIREMENT_READINESS: &str = "/api/retirement-readiness";

/// Path of the cover letter generator.
pub const COVER_LETTER: &str = "/api/cover-letter";

/// Every protected endpoint path, in routing order.
pub const PROTECTED: [&str; 4] = [
    SALARY_COMPARISON,
    CAREER_ROADMAP,
    RETIREMENT_READINESS,
    COVER_LETTER,
];

#[derive(Debug, Deserialize)]
struct SalaryComparisonRequest {
    job_title: String,
    location: String,
    #[serde(default)]
    years_experience: u32,
}

#[derive(Debug, Deserialize)]
struct CareerRoadmapRequest {
    current_role: String,
    target_role: String,
    #[serde(default)]
    timeframe_years: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RetirementReadinessRequest {
    age: u32,
    retirement_age: u32,
    current_savings: f64,
    annual_income: f64,
}

#[derive(Debug, Deserialize)]
struct CoverLetterRequest {
    job_title: String,
    company: String,
    #[serde(default)]
    highlights: Vec<String>,
}

/// Builds the completion prompt for the given endpoint from its raw
/// JSON payload.
///
/// Returns [`GatewayError::UnknownEndpoint`] for paths not in
/// [`PROTECTED`] and [`GatewayError::BadRequest`] for payloads that
/// fail deserialization or validation.
pub fn build_prompt(endpoint: &str, payload: &[u8]) -> Result<String> {
    match endpoint {
        SALARY_COMPARISON => salary_comparison_prompt(parse(payload)?),
        CAREER_ROADMAP => career_roadmap_prompt(parse(payload)?),
        RETIREMENT_READINESS => retirement_readiness_prompt(parse(payload)?),
        COVER_LETTER => cover_letter_prompt(parse(payload)?),
        other => Err(GatewayError::UnknownEndpoint(other.to_owned())),
    }
}

fn parse<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| GatewayError::BadRequest(format!("invalid payload: {e}")))
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(GatewayError::BadRequest(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

fn salary_comparison_prompt(req: SalaryComparisonRequest) -> Result<String> {
    require("job_title", &req.job_title)?;
    require("location", &req.location)?;

    Ok(format!(
        "You are a compensation analyst. Provide a realistic salary range \
         for a {} in {} with {} years of experience. Respond with a short \
         JSON object containing low, median, and high annual figures in USD \
         and a one-sentence market summary.",
        req.job_title.trim(),
        req.location.trim(),
        req.years_experience,
    ))
}

fn career_roadmap_prompt(req: CareerRoadmapRequest) -> Result<String> {
    require("current_role", &req.current_role)?;
    require("target_role", &req.target_role)?;

    let timeframe = req.timeframe_years.unwrap_or(5);
    Ok(format!(
        "You are a career coach. Outline a step-by-step roadmap for moving \
         from {} to {} within {} years. Respond with a numbered list of \
         milestones, each with the skills to acquire and a rough timeline.",
        req.current_role.trim(),
        req.target_role.trim(),
        timeframe,
    ))
}

fn retirement_readiness_prompt(req: RetirementReadinessRequest) -> Result<String> {
    if req.retirement_age <= req.age {
        return Err(GatewayError::BadRequest(
            "retirement_age must be greater than age".into(),
        ));
    }
    if req.current_savings < 0.0 || req.annual_income < 0.0 {
        return Err(GatewayError::BadRequest(
            "savings and income must be non-negative".into(),
        ));
    }

    Ok(format!(
        "You are a retirement planner. A {}-year-old earning ${:.0} per \
         year has ${:.0} saved and plans to retire at {}. Assess their \
         retirement readiness. Respond with a short JSON object containing \
         a readiness score out of 100, the projected savings at retirement, \
         and two concrete recommendations.",
        req.age, req.annual_income, req.current_savings, req.retirement_age,
    ))
}

fn cover_letter_prompt(req: CoverLetterRequest) -> Result<String> {
    require("job_title", &req.job_title)?;
    require("company", &req.company)?;

    let highlights = if req.highlights.is_empty() {
        "their relevant professional experience".to_owned()
    } else {
        req.highlights.join("; ")
    };

    Ok(format!(
        "You are a professional resume writer. Draft a concise, \
         three-paragraph cover letter for a {} position at {}. Emphasize: \
         {}. Keep the tone confident and specific; do not invent \
         credentials.",
        req.job_title.trim(),
        req.company.trim(),
        highlights,
    ))
}
