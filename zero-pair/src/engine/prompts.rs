//! System prompts for the workspace engine.

use super::ChatMode;

const CODE_PROMPT: &str = "Act as an expert software developer. \
Always use best practices when coding. Respect and use existing conventions, \
libraries, etc that are already present in the code base. \
Take requests for changes to the supplied code. If a request is ambiguous, ask questions.";

const ASK_PROMPT: &str = "Act as an expert code analyst. \
Answer questions about the supplied code. \
Do not propose edits unless asked to.";

const ARCHITECT_PROMPT: &str = "Act as an expert architect engineer and provide direction to your editor engineer. \
Study the change request and the current code. \
Describe how to modify the code to complete the request. \
The editor engineer will rely solely on your instructions, so make them unambiguous and complete.";

const HELP_PROMPT: &str = "You are an expert on this pair-programming service. \
Answer questions about how to use its slash commands and HTTP endpoints. \
Be concise and refer to commands by their /name.";

const COMMIT_PROMPT: &str = "You are an expert software engineer that generates concise, \
one-line git commit messages based on the provided diff. \
Use the imperative mood. Reply with only the commit message, no quotes.";

pub(super) const FILES_PREFIX: &str =
    "I have added these files to the chat so you can go ahead and edit them.";
pub(super) const FILES_ACK: &str = "Ok, any changes I propose will be to those files.";
pub(super) const READ_ONLY_PREFIX: &str =
    "Here are some READ ONLY files, provided for your reference. Do not edit these files!";
pub(super) const READ_ONLY_ACK: &str = "Ok, I will use these files as references.";
pub(super) const MAP_PREFIX: &str =
    "Here is a map of the files in my repository. None have been added to the chat yet.";
pub(super) const MAP_ACK: &str = "Ok, I will ask you to add files to the chat when I need to edit them.";

pub(super) fn system_prompt(mode: ChatMode, edit_format: &str) -> String {
    match mode {
        ChatMode::Code => format!(
            "{CODE_PROMPT}\nDescribe every change using the \"{edit_format}\" edit format."
        ),
        ChatMode::Ask => ASK_PROMPT.to_string(),
        ChatMode::Architect => ARCHITECT_PROMPT.to_string(),
        ChatMode::Help => HELP_PROMPT.to_string(),
    }
}

pub(super) fn commit_prompt() -> &'static str {
    COMMIT_PROMPT
}

/// Render a file for inclusion in the prompt.
pub(super) fn fenced(path: &str, content: &str) -> String {
    let mut out = format!("{path}\n```\n{content}");
    if !content.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("```\n");
    out
}
