use crate::core::jobs::JobParams;

const CRAWL_TASK: &str = "Walk this sales funnel forward one page at a time, the way an \
interested buyer would. Accept the cheapest offer, decline upsells and downsells, and fill \
forms with plausible test data. Stop when you reach an order confirmation or a checkout \
page that requires real payment details.";

/// System framing sent at the head of every conversation.
pub fn build_instruction(params: &JobParams) -> String {
    let task = params
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(CRAWL_TASK);

    format!(
        r#"You control a web browser through screenshots.

TASK: {task}
Entry URL: {entry}
Viewport: {width}x{height} pixels. Coordinates use a 0-999 grid on both axes, where (0,0) is the top-left corner and (999,999) the bottom-right.

Reply with exactly one JSON object and nothing else, in one of these shapes:
{{"decision":"act","action":<action>,"reasoning":"<one sentence>"}}
{{"decision":"done","summary":"<what was achieved>"}}
{{"decision":"blocked","reason":"<captcha, paywall, login wall, ...>"}}

<action> is one of:
{{"type":"navigate","url":"https://..."}}
{{"type":"click","x":<0-999>,"y":<0-999>}}
{{"type":"type","text":"...","x":<0-999>,"y":<0-999>,"press_enter":false}}
{{"type":"scroll","dx":0,"dy":<pixels, positive scrolls down>}}
{{"type":"wait","ms":<up to 10000>}}
{{"type":"go_back"}}

Choose "blocked" only when progress is impossible without a human."#,
        task = task,
        entry = params.entry_url,
        width = params.viewport.width,
        height = params.viewport.height,
    )
}
