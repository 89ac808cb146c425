#![no_main]

use libfuzzer_sys::fuzz_target;
use pkgsync_webhook::{EVENT_HEADER, EventKind, GithubWebhook, SIGNATURE_HEADER, WebhookRequest, sign};

const ACCEPTED: &[EventKind] = &[EventKind::Push, EventKind::Ping];

fuzz_target!(|input: (u8, &[u8])| {
    let (selector, body) = input;
    let event = match selector % 3 {
        0 => "push",
        1 => "ping",
        _ => "issues",
    };

    let open = GithubWebhook::new(None);
    let request = WebhookRequest::new(body.to_vec()).with_header(EVENT_HEADER, event);
    let _ = open.parse(&request, ACCEPTED);

    // a correctly signed body must never fail verification
    let signed = GithubWebhook::new(Some("fuzz".to_string()));
    let request = WebhookRequest::new(body.to_vec())
        .with_header(EVENT_HEADER, event)
        .with_header(SIGNATURE_HEADER, sign("fuzz", body));
    if let Err(e) = signed.parse(&request, ACCEPTED) {
        assert_ne!(e.status(), 403);
    }
});
