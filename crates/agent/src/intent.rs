//! Intent detection for free-text messages.
//!
//! The language model is asked for a JSON verdict; when it is unavailable or
//! answers with something unparseable, a bilingual keyword table decides.

use serde::{Deserialize, Serialize};

use dona_core::domain::user::Language;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Task,
    Reminder,
    Help,
    Summary,
    Status,
    Config,
    Question,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Reminder => "reminder",
            Self::Help => "help",
            Self::Summary => "summary",
            Self::Status => "status",
            Self::Config => "config",
            Self::Question => "question",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "task" | "tarea" => Some(Self::Task),
            "reminder" | "recordatorio" => Some(Self::Reminder),
            "help" | "ayuda" => Some(Self::Help),
            "summary" | "resumen" => Some(Self::Summary),
            "status" | "estado" => Some(Self::Status),
            "config" | "configuracion" => Some(Self::Config),
            "question" | "pregunta" => Some(Self::Question),
            _ => None,
        }
    }

    pub fn suggested_command(&self) -> Option<&'static str> {
        match self {
            Self::Task => Some("/dona-task create"),
            Self::Reminder => Some("/dona-remind"),
            Self::Help => Some("/dona-help"),
            Self::Summary => Some("/dona-summary"),
            Self::Status => Some("/dona-status"),
            Self::Config => Some("/dona-config"),
            Self::Question => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntentClassification {
    pub intent: Intent,
    /// 1..=10
    pub confidence: u8,
    pub suggested_command: Option<String>,
}

impl IntentClassification {
    fn rule_based(intent: Intent, confidence: u8) -> Self {
        Self {
            intent,
            confidence,
            suggested_command: intent.suggested_command().map(str::to_owned),
        }
    }
}

const KEYWORDS: &[(Intent, u8, &[&str])] = &[
    (Intent::Task, 7, &["task", "tarea", "hacer", "create", "crear", "todo", "pendiente"]),
    (Intent::Reminder, 7, &["remind", "reminder", "recordar", "recordatorio", "recuérdame"]),
    (Intent::Help, 8, &["help", "ayuda", "commands", "comandos"]),
    (Intent::Summary, 7, &["summary", "resumen", "status", "estado", "report", "reporte"]),
];

/// Keyword classification. The first row of the table with a match wins.
pub fn classify(text: &str) -> IntentClassification {
    let lowered = text.to_lowercase();
    let words: Vec<&str> =
        lowered.split(|ch: char| !ch.is_alphanumeric()).filter(|w| !w.is_empty()).collect();

    KEYWORDS
        .iter()
        .find(|(_, _, keywords)| keywords.iter().any(|keyword| words.contains(keyword)))
        .map(|(intent, confidence, _)| IntentClassification::rule_based(*intent, *confidence))
        .unwrap_or_else(|| IntentClassification::rule_based(Intent::Question, 5))
}

#[derive(Deserialize)]
struct ModelVerdict {
    intent: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    suggested_command: Option<String>,
}

/// Reads the model's JSON verdict, tolerating a surrounding code fence.
pub fn parse_model_verdict(content: &str) -> Option<IntentClassification> {
    let trimmed = content.trim();
    let json = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return None,
    };
    let verdict: ModelVerdict = serde_json::from_str(json).ok()?;
    let intent = Intent::parse(&verdict.intent)?;
    let confidence = verdict.confidence.map(|c| c.round().clamp(1.0, 10.0) as u8).unwrap_or(5);

    Some(IntentClassification {
        intent,
        confidence,
        suggested_command: verdict
            .suggested_command
            .filter(|command| command.starts_with('/'))
            .or_else(|| intent.suggested_command().map(str::to_owned)),
    })
}

/// Deterministic reply used whenever the language model cannot answer.
pub fn fallback_response(intent: Intent, language: Language) -> &'static str {
    match (intent, language) {
        (Intent::Task, Language::Es) => {
            "Parece que quieres gestionar tareas. Usa `/dona-task create <descripción>` para crear una."
        }
        (Intent::Task, Language::En) => {
            "Looks like you want to manage tasks. Use `/dona-task create <description>` to add one."
        }
        (Intent::Reminder, Language::Es) => {
            "Los recordatorios aún no están disponibles. Mientras tanto, crea una tarea con fecha: `/dona-task create <descripción> due:AAAA-MM-DD`."
        }
        (Intent::Reminder, Language::En) => {
            "Reminders are not available yet. Meanwhile, create a task with a due date: `/dona-task create <description> due:YYYY-MM-DD`."
        }
        (Intent::Help, Language::Es) => {
            "Algunos comandos útiles:\n• `/dona-help` ayuda completa\n• `/dona-task` tareas\n• `/dona-time` control de tiempo\n• `/dona-summary` resumen"
        }
        (Intent::Help, Language::En) => {
            "Some useful commands:\n• `/dona-help` full help\n• `/dona-task` tasks\n• `/dona-time` time tracking\n• `/dona-summary` summary"
        }
        (Intent::Summary | Intent::Status, Language::Es) => {
            "Para ver tu actividad usa `/dona-summary today`, `/dona-summary week` o `/dona-status`."
        }
        (Intent::Summary | Intent::Status, Language::En) => {
            "To see your activity use `/dona-summary today`, `/dona-summary week` or `/dona-status`."
        }
        (Intent::Config, Language::Es) => {
            "Puedes cambiar tus preferencias con `/dona-config` en un mensaje directo."
        }
        (Intent::Config, Language::En) => {
            "You can change your preferences with `/dona-config` in a direct message."
        }
        (Intent::Question, Language::Es) => {
            "¡Hola! Soy Dona, tu asistente. ¿En qué te ayudo? Usa `/dona-help` para ver los comandos."
        }
        (Intent::Question, Language::En) => {
            "Hi! I'm Dona, your assistant. How can I help? Use `/dona-help` to see the commands."
        }
    }
}
