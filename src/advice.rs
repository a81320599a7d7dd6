//! Care advice from current readings plus recent history.

use log::{debug, info};
use serde::Deserialize;

use crate::{
    model::{MissingApiKey, ModelError, ModelProvider, Part},
    models::{format_readings, LogEntry, WaterData},
    store::HISTORY_LIMIT,
};

pub const DEFAULT_FISH_TYPE: &str = "common tropical fish";
pub const DEFAULT_TANK_TYPE: &str = "freshwater";
pub const NOTES_EXCERPT_CHARS: usize = 50;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdviceRequest {
    pub water_data: Option<WaterData>,
    pub notes: Option<String>,
    pub fish_type: Option<String>,
    pub tank_type: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Gemini API key is not configured")]
    Configuration(#[from] MissingApiKey),

    #[error("Could not generate advice")]
    Model(#[from] ModelError),
}

/// First [`NOTES_EXCERPT_CHARS`] characters of `notes`, with `...` when cut.
pub fn notes_excerpt(notes: &str) -> String {
    let mut excerpt: String = notes.chars().take(NOTES_EXCERPT_CHARS).collect();
    if notes.chars().count() > NOTES_EXCERPT_CHARS {
        excerpt.push_str("...");
    }
    excerpt
}

fn history_section(history: &[LogEntry]) -> String {
    if history.is_empty() {
        return String::new();
    }

    let mut section = String::from("\n\n[Reference: past log history]\n");
    for (i, entry) in history.iter().take(HISTORY_LIMIT as usize).enumerate() {
        let readings =
            format_readings(&entry.water_data).unwrap_or_else(|| "no data".to_string());
        section.push_str(&format!(
            "{}. {} - Water quality: {readings}",
            i + 1,
            entry.log_date.format("%Y-%m-%d")
        ));
        if let Some(notes) = entry.notes.as_deref().filter(|notes| !notes.is_empty()) {
            section.push_str(&format!(" (Notes: {})", notes_excerpt(notes)));
        }
        section.push('\n');
    }
    section.push_str(
        "\nTaking the past data above into account, point out any trends in the water quality \
         and anything that could be improved.",
    );

    section
}

/// Builds the advice prompt. `history` is expected newest first.
pub fn build_prompt(request: &AdviceRequest, history: &[LogEntry]) -> String {
    let readings = request
        .water_data
        .as_ref()
        .and_then(format_readings)
        .unwrap_or_else(|| "(no data)".to_string());

    format!(
        "You are an aquarium expert. Based on the tank data below, give specific advice that is easy to follow.\n\n\
         [Current state]\n\
         Tank type: {tank}\n\
         Main fish: {fish}\n\
         Water quality: {readings}\n\
         Other notes: {notes}\
         {history}\n\n\
         Give a diagnosis and explain concretely what to do so the fish can live comfortably. \
         List improvements as bullet points, avoid jargon, and explain it so a beginner can understand. \
         If the current water quality is good, give advice on keeping it that way. \
         If there is past data, also comment on how it has been changing.",
        tank = request.tank_type.as_deref().unwrap_or(DEFAULT_TANK_TYPE),
        fish = request.fish_type.as_deref().unwrap_or(DEFAULT_FISH_TYPE),
        notes = request.notes.as_deref().unwrap_or_default(),
        history = history_section(history),
    )
}

/// Makes exactly one model call and returns its text untouched.
pub async fn generate_advice(
    provider: &dyn ModelProvider,
    request: &AdviceRequest,
    history: &[LogEntry],
) -> Result<String, Error> {
    let model = provider.model()?;
    let prompt = build_prompt(request, history);
    debug!("Advice prompt: {prompt}");

    let advice = model.generate_content(&[Part::Text(prompt)], None).await?;
    info!(
        "Generated {} characters of advice with {}",
        advice.len(),
        model.model_name()
    );

    Ok(advice)
}
