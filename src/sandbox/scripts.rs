//! Shell scripts executed inside sandbox containers.

/// One-time key generation, run right after a sandbox container is
/// created. Idempotent: an existing key pair is left alone.
pub const GENERATE_SSH_KEY: &str = r#"#!/bin/bash
echo "This is your personal sandbox. .ssh/id_rsa.pub and .ssh/config are updated automatically." > /root/README

mkdir -p /root/.ssh
chmod 700 /root/.ssh
cd /root/.ssh

[ -f /root/.ssh/id_rsa ] || ssh-keygen -f /root/.ssh/id_rsa -t rsa -N ''

echo "id_rsa and id_rsa.pub are managed by the bastion, do not modify them" > README
"#;

/// One `Host` block of the seeded ssh config.
#[derive(Debug, Clone, PartialEq)]
pub struct SshEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// Builds the script that rewrites `/root/.ssh/config` with one entry
/// per currently-valid grant, so `ssh <server>-<account>` from inside
/// the sandbox routes back through the bastion.
pub fn seed_ssh_config(entries: &[SshEntry]) -> String {
    let mut script = String::from("#!/bin/bash\nrm -f /root/.ssh/config\n");
    for entry in entries {
        script.push('\n');
        script.push_str(&format!(
            "echo \"Host {}\" >> /root/.ssh/config\n",
            entry.name
        ));
        script.push_str(&format!(
            "echo \"  HostName {}\" >> /root/.ssh/config\n",
            entry.host
        ));
        script.push_str(&format!(
            "echo \"  Port {}\" >> /root/.ssh/config\n",
            entry.port
        ));
        script.push_str(&format!(
            "echo \"  User {}\" >> /root/.ssh/config\n",
            entry.user
        ));
    }
    script
}
