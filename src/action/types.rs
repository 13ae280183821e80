use serde::{Deserialize, Serialize};

/// Upper bound (inclusive) of the normalized coordinate space on both axes.
pub const NORMALIZED_MAX: u32 = 999;

/// A screen position in normalized 0–999 space, independent of device resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Builds a point from raw model numbers, clamping into 0..=999.
    pub fn clamped(x: f64, y: f64) -> Self {
        let clamp = |v: f64| -> u32 {
            if v.is_nan() || v <= 0.0 {
                0
            } else if v >= NORMALIZED_MAX as f64 {
                NORMALIZED_MAX
            } else {
                v.round() as u32
            }
        };
        let p = Self::new(clamp(x), clamp(y));
        if x < 0.0 || y < 0.0 || x > NORMALIZED_MAX as f64 || y > NORMALIZED_MAX as f64 {
            tracing::warn!(x, y, clamped_x = p.x, clamped_y = p.y, "coordinate outside 0-999, clamped");
        }
        p
    }
}

/// One device operation the model may request, or the terminal `Finish` signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Launch { app: String },
    /// `confirm` is set when the model marks the tap as sensitive (payment, privacy).
    Tap { point: Point, confirm: Option<String> },
    Type { text: String },
    TypeName { text: String },
    Swipe { start: Point, end: Point },
    LongPress { point: Point },
    DoubleTap { point: Point },
    Back,
    Home,
    Wait { seconds: f64 },
    Note { message: String },
    CallApi { instruction: String },
    Interact,
    TakeOver { message: String },
    Finish { message: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Launch { .. } => "Launch",
            Action::Tap { .. } => "Tap",
            Action::Type { .. } => "Type",
            Action::TypeName { .. } => "Type_Name",
            Action::Swipe { .. } => "Swipe",
            Action::LongPress { .. } => "Long Press",
            Action::DoubleTap { .. } => "Double Tap",
            Action::Back => "Back",
            Action::Home => "Home",
            Action::Wait { .. } => "Wait",
            Action::Note { .. } => "Note",
            Action::CallApi { .. } => "Call_API",
            Action::Interact => "Interact",
            Action::TakeOver { .. } => "Take_over",
            Action::Finish { .. } => "finish",
        }
    }
}

/// What the parser hands to device automation.
///
/// `RawText` is the degraded outcome: the model produced something that could not
/// be decoded into a typed action. It is still dispatched so the device side can
/// report a proper failure instead of the loop stalling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParsedAction {
    Action(Action),
    RawText(String),
}

impl ParsedAction {
    pub fn as_action(&self) -> Option<&Action> {
        match self {
            ParsedAction::Action(a) => Some(a),
            ParsedAction::RawText(_) => None,
        }
    }
}
