//! Command rewriting for the proxy path.
//!
//! Every command an operator sends to a target is wrapped so it runs
//! under the granted target account instead of the account the
//! outbound hop authenticates as.

/// Command substituted when an operator-supplied string cannot be
/// tokenised as a shell command. Prints an error and exits non-zero
/// instead of letting raw bytes through.
const MALFORMED_COMMAND: &str = "echo 'malformed command' >&2; exit 1";

/// Wraps `input` so it executes as `target_account` on the far side:
/// `sudo -S -n -u <account> -i -- bash -c <quoted input>`. An empty
/// input yields the bare login invocation used for `shell` requests.
pub fn modify_command(target_account: &str, input: &str) -> String {
    if input.is_empty() {
        shell_words::join(["sudo", "-S", "-n", "-u", target_account, "-i"])
    } else {
        shell_words::join([
            "sudo",
            "-S",
            "-n",
            "-u",
            target_account,
            "-i",
            "--",
            "bash",
            "-c",
            input,
        ])
    }
}

/// Splits an operator command into tokens. A blank command becomes
/// the default shell; an untokenisable one becomes a safe error
/// command rather than raw bytes.
pub fn tokenize_command(input: &str) -> Vec<String> {
    match shell_words::split(input) {
        Ok(tokens) if tokens.is_empty() => vec!["/bin/bash".to_string()],
        Ok(tokens) => tokens,
        Err(_) => vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            MALFORMED_COMMAND.to_string(),
        ],
    }
}

/// Whether a session running `tokens` should be recorded. SCP
/// transfers are skipped: their payload would bloat replays without
/// being replayable.
pub fn should_record(tokens: &[String]) -> bool {
    match tokens.first() {
        Some(first) => !first.trim().eq_ignore_ascii_case("scp"),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modify_command_shell() {
        assert_eq!(modify_command("deploy", ""), "sudo -S -n -u deploy -i");
    }

    #[test]
    fn test_modify_command_exec() {
        assert_eq!(
            modify_command("deploy", "uptime"),
            "sudo -S -n -u deploy -i -- bash -c uptime"
        );
        assert_eq!(
            modify_command("deploy", "ls -la /tmp"),
            "sudo -S -n -u deploy -i -- bash -c 'ls -la /tmp'"
        );
    }

    #[test]
    fn test_modify_command_quoting() {
        let rewritten = modify_command("deploy", "echo 'it''s'; rm -rf /");
        // the whole operator command stays one bash -c argument
        let tokens = shell_words::split(&rewritten).unwrap();
        assert_eq!(tokens[..9].to_vec(), vec![
            "sudo", "-S", "-n", "-u", "deploy", "-i", "--", "bash", "-c"
        ]);
        assert_eq!(tokens[9], "echo 'it''s'; rm -rf /");
        assert_eq!(tokens.len(), 10);
    }

    #[test]
    fn test_tokenize_command() {
        assert_eq!(tokenize_command("ls -la"), vec!["ls", "-la"]);
        assert_eq!(tokenize_command(""), vec!["/bin/bash"]);
        assert_eq!(tokenize_command("   "), vec!["/bin/bash"]);
    }

    #[test]
    fn test_tokenize_malformed_substitutes_error_command() {
        // unterminated quote cannot be tokenised
        let tokens = tokenize_command("echo 'oops");
        assert_eq!(tokens[0], "/bin/bash");
        assert_eq!(tokens[1], "-c");
        assert!(tokens[2].contains("exit 1"));
    }

    #[test]
    fn test_should_record() {
        assert!(should_record(&["ls".to_string()]));
        assert!(should_record(&[]));
        assert!(!should_record(&["scp".to_string(), "-t".to_string()]));
        assert!(!should_record(&["SCP".to_string()]));
        assert!(!should_record(&[" scp ".to_string()]));
        assert!(should_record(&["/bin/bash".to_string()]));
    }
}
