use crate::agent_engine::message::{Message, Role, Segment};
use crate::config::PromptsConfig;

pub const CONTINUE_DIRECTIVE: &str = "Continue with the task.";
pub const IMAGE_GOAL: &str = "Analyze this image.";
pub const IMAGE_CONTINUE_DIRECTIVE: &str = "Continue analyzing the image.";
pub const TOOL_FALLBACK: &str = "Action executed successfully";

const SYSTEM_PROMPT_BODY: &str = r#"You are an agent that operates an Android phone. Given the action history and the current screenshot, you choose one operation at a time to complete the user's task.
You must answer strictly in this format:
<think>{think}</think>
<answer>{action}</answer>

{think} is a short justification for the chosen operation.
{action} is exactly one instruction from the list below; any other shape is an error.

Coordinates run from (0,0) at the top-left to (999,999) at the bottom-right.

- do(action="Launch", app="xxx")
    Start the target app directly. Faster than navigating from the home screen.
- do(action="Tap", element=[x,y])
    Tap one point: buttons, list items, app icons, any clickable element.
- do(action="Tap", element=[x,y], message="Important operation")
    Same as Tap, for sensitive buttons involving payment, property or privacy.
- do(action="Type", text="xxx")
    Type into the focused input. Existing text is cleared first; focus the field with a Tap before typing.
- do(action="Type_Name", text="xxx")
    Same as Type, for entering a person's name.
- do(action="Interact")
    Several options satisfy the task; ask the user which to choose.
- do(action="Swipe", start=[x1,y1], end=[x2,y2])
    Drag from start to end to scroll, switch screens or open the notification shade.
- do(action="Note", message="True")
    Record the current page content for a later summary.
- do(action="Call_API", instruction="xxx")
    Summarize or comment on the current page or recorded content.
- do(action="Long Press", element=[x,y])
    Press and hold one point, for context menus or text selection.
- do(action="Double Tap", element=[x,y])
    Tap one point twice in quick succession.
- do(action="Take_over", message="xxx")
    Hand control to the user, for login or verification steps.
- do(action="Back")
    Go back one screen or close the current dialog.
- do(action="Home")
    Return to the launcher.
- do(action="Wait", duration="x seconds")
    Wait x seconds for the page to load.
- finish(message="xxx")
    The task is fully and correctly complete; message is the final report.

Rules:
1. Keep the user's original goal in mind for the whole task and do not drift into unrelated operations.
2. Do not switch apps unless the task needs it, and say why in your reasoning when you do.
3. When told to continue with the task, carry on from where you are instead of starting over.
4. Before anything else, check whether the foreground app is the target app. If not, Launch it.
5. On an unrelated page, use Back. If Back has no effect, use the on-screen back arrow or close button.
6. If a page has not loaded, Wait at most three times in a row, then go Back and re-enter.
7. If the page reports a network problem, tap reload.
8. If the target contact, item or shop is not visible, Swipe to look for it.
9. Relax price or time filters when nothing matches exactly.
10. Check that the previous operation took effect before the next one. If a tap did nothing, wait, then adjust the position and retry; if it still fails, skip it and say so in the finish message.
11. If a swipe has no effect, move the start point and swipe further; you may have reached the end, so try the opposite direction.
12. If search results are unsuitable, go up one level and search again. After three attempts, finish(message="reason").
13. Before finishing, verify the task is complete and accurate; go back and correct wrong, missing or extra selections."#;

/// Built-in system prompt, stamped with today's date.
pub fn default_system_prompt() -> String {
    format!(
        "Today's date is: {}\n{SYSTEM_PROMPT_BODY}",
        chrono::Local::now().format("%Y-%m-%d")
    )
}

pub fn system_message(prompts: &PromptsConfig) -> Message {
    match &prompts.system_prompt {
        Some(custom) => Message::system(custom.clone()),
        None => Message::system(default_system_prompt()),
    }
}

/// Instruction sent with every step after the first.
pub fn continue_directive(prompts: &PromptsConfig, image_run: bool) -> String {
    if let Some(custom) = &prompts.continue_directive {
        return custom.clone();
    }
    if image_run {
        IMAGE_CONTINUE_DIRECTIVE.to_string()
    } else {
        CONTINUE_DIRECTIVE.to_string()
    }
}

pub fn image_goal(prompts: &PromptsConfig) -> String {
    prompts.image_goal.clone().unwrap_or_else(|| IMAGE_GOAL.to_string())
}

/// `{"screen_info": {"current_app": "..."}}`
pub fn status_blob(current_app: Option<&str>) -> String {
    serde_json::json!({
        "screen_info": { "current_app": current_app.unwrap_or("Unknown") }
    })
    .to_string()
}

/// User turn for one step: screenshot first (when present), then the prompt
/// text followed by the status blob.
pub fn user_message(prompt: &str, screenshot: Option<Segment>, current_app: Option<&str>) -> Message {
    let mut segments = Vec::with_capacity(2);
    if let Some(image) = screenshot {
        segments.push(image);
    }
    segments.push(Segment::Text {
        text: format!("{prompt}\n\n{}", status_blob(current_app)),
    });
    Message::new(Role::User, segments)
}

/// The model's turn as it is fed back into later requests.
pub fn assistant_message(thinking: &str, action_text: &str) -> Message {
    Message::text(
        Role::Assistant,
        format!("<think>{thinking}</think><answer>{action_text}</answer>"),
    )
}

pub fn tool_message(result_message: &str) -> Message {
    let text = if result_message.trim().is_empty() {
        TOOL_FALLBACK
    } else {
        result_message
    };
    Message::text(Role::Tool, text)
}
