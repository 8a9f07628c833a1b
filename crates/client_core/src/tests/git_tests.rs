use super::*;

fn context_with_everything() -> ServerEventContext {
    ServerEventContext {
        git_corrupted: true,
        git_error: Some("index.lock exists".to_string()),
        git_init: Some("no repository found".to_string()),
        git_message: Some(GitPrompt {
            message: "stash changes?".to_string(),
            options: vec!["Yes".to_string(), "No".to_string()],
        }),
        git_merge_result: Some(MergeResult {
            success: true,
            message: "merged".to_string(),
        }),
        ..ServerEventContext::default()
    }
}

#[test]
fn prompts_come_out_most_urgent_first() {
    let kinds: Vec<_> = pending_prompts(&context_with_everything())
        .iter()
        .map(ActiveGitPrompt::kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            GitPromptKind::Corrupted,
            GitPromptKind::Error,
            GitPromptKind::Init,
            GitPromptKind::AskUser,
            GitPromptKind::MergeResult,
        ]
    );
    assert_eq!(
        active_prompt(&context_with_everything()),
        Some(ActiveGitPrompt::Corrupted)
    );
    assert_eq!(active_prompt(&ServerEventContext::default()), None);
}

#[test]
fn merge_result_alone_does_not_block_input() {
    let merge_only = ServerEventContext {
        git_merge_result: Some(MergeResult {
            success: false,
            message: "conflict in src/lib.rs".to_string(),
        }),
        ..ServerEventContext::default()
    };
    assert!(!blocks_input(&merge_only));

    let asking = ServerEventContext {
        git_init: Some("init?".to_string()),
        ..merge_only
    };
    assert!(blocks_input(&asking));
    assert!(!blocks_input(&ServerEventContext::default()));
}

#[test]
fn resolution_needs_a_matching_pending_prompt() {
    let context = ServerEventContext {
        git_init: Some("init?".to_string()),
        ..ServerEventContext::default()
    };

    GitResolution::Init(GitAction::Git)
        .validate(&context)
        .expect("init prompt pending");

    let err = GitResolution::Error(GitAction::Retry)
        .validate(&context)
        .expect_err("no git error pending");
    assert_eq!(err, SessionError::NoPendingPrompt("git error"));
}

#[test]
fn resolution_rejects_actions_for_other_prompts() {
    let err = GitResolution::AskUser(GitAction::Retry)
        .validate(&context_with_everything())
        .expect_err("retry does not answer a question");
    assert_eq!(
        err,
        SessionError::InvalidResolution {
            prompt: "git question",
            action: GitAction::Retry,
        }
    );
}

#[test]
fn resolutions_map_to_server_events() {
    let resolve = GitResolution::Error(GitAction::Nogit).to_event();
    assert_eq!(resolve.kind, "GitResolve");
    assert_eq!(resolve.content, json!({"action": "nogit"}));
    assert_eq!(resolve.producer, "user");

    let corrupted = GitResolution::Corrupted.to_event();
    assert_eq!(corrupted.kind, "GitCorruptedResolved");
    assert_eq!(corrupted.content, json!({"action": "yes"}));
    assert!(GitResolution::Corrupted.requires_reset());

    let merged = GitResolution::MergeResult.to_event();
    assert_eq!(merged.kind, "GitMergeResolve");
    assert_eq!(merged.content, json!({}));
    assert!(!GitResolution::MergeResult.requires_reset());
}

#[test]
fn merge_request_trims_the_message() {
    assert_eq!(
        default_merge_message("main"),
        "Merge branch 'theseus_agent' into main"
    );

    let event = merge_request("  Merge agent work \n");
    assert_eq!(event.kind, "GitMerge");
    assert_eq!(event.content, json!({"commit_message": "Merge agent work"}));
}
