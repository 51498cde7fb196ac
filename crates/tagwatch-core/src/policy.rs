//! User policy flags and the commands they translate to.

use serde::{Deserialize, Serialize};

use tagwatch_types::{AlertMode, Command};

/// Policy switches set by the user or by the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFlags {
    /// Low-power sleep mode.
    pub sleep: bool,
    /// Anti-theft mode: alert loudly as soon as the tag leaves.
    pub pick_pocket: bool,
    /// Do not disturb.
    pub dnd: bool,
    /// Connected to a Wi-Fi network marked safe.
    pub wifi_safe_zone: bool,
}

/// The policy that wins after precedence is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Pick-pocket overrides everything.
    PickPocket,
    /// Sleep.
    Sleep,
    /// DND or safe zone.
    Quiet,
    /// No flag set.
    Normal,
}

impl PolicyFlags {
    /// Resolve precedence: pick-pocket, then sleep, then DND / safe zone.
    pub fn mode(&self) -> PolicyMode {
        if self.pick_pocket {
            PolicyMode::PickPocket
        } else if self.sleep {
            PolicyMode::Sleep
        } else if self.dnd || self.wifi_safe_zone {
            PolicyMode::Quiet
        } else {
            PolicyMode::Normal
        }
    }

    /// Whether finalized disconnects should be reported without alerting.
    pub fn suppresses_alerts(&self) -> bool {
        matches!(self.mode(), PolicyMode::Sleep | PolicyMode::Quiet)
    }
}

/// Commands that bring a tag in line with the policy.
///
/// `record_alert` is the alert mode configured for the tag, used when no
/// policy overrides it.
///
/// # Examples
///
/// ```
/// use tagwatch_core::{PolicyFlags, commands_for_policy};
/// use tagwatch_types::{AlertMode, Command};
///
/// let flags = PolicyFlags { pick_pocket: true, ..Default::default() };
/// let cmds = commands_for_policy(&flags, AlertMode::Low, 5);
/// assert_eq!(cmds[0], Command::SetAlertMode(AlertMode::High));
/// ```
pub fn commands_for_policy(
    flags: &PolicyFlags,
    record_alert: AlertMode,
    pick_pocket_buffer_secs: u8,
) -> Vec<Command> {
    let (alert, adaptive, pick_pocket) = match flags.mode() {
        PolicyMode::PickPocket => (AlertMode::High, false, true),
        PolicyMode::Sleep | PolicyMode::Quiet => (AlertMode::Low, true, false),
        PolicyMode::Normal => (record_alert, true, false),
    };

    vec![
        Command::SetAlertMode(alert),
        Command::SetAdaptiveMode(adaptive),
        Command::SetPickPocketMode {
            enabled: pick_pocket,
            buffer_secs: pick_pocket_buffer_secs,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let all = PolicyFlags {
            sleep: true,
            pick_pocket: true,
            dnd: true,
            wifi_safe_zone: true,
        };
        assert_eq!(all.mode(), PolicyMode::PickPocket);

        let sleep_and_dnd = PolicyFlags {
            sleep: true,
            dnd: true,
            ..Default::default()
        };
        assert_eq!(sleep_and_dnd.mode(), PolicyMode::Sleep);

        let safe_zone = PolicyFlags {
            wifi_safe_zone: true,
            ..Default::default()
        };
        assert_eq!(safe_zone.mode(), PolicyMode::Quiet);
        assert_eq!(PolicyFlags::default().mode(), PolicyMode::Normal);
    }

    #[test]
    fn test_pick_pocket_commands() {
        let flags = PolicyFlags {
            pick_pocket: true,
            sleep: true,
            ..Default::default()
        };
        assert_eq!(
            commands_for_policy(&flags, AlertMode::Low, 5),
            vec![
                Command::SetAlertMode(AlertMode::High),
                Command::SetAdaptiveMode(false),
                Command::SetPickPocketMode {
                    enabled: true,
                    buffer_secs: 5
                },
            ]
        );
    }

    #[test]
    fn test_quiet_modes_force_low_alert() {
        for flags in [
            PolicyFlags {
                sleep: true,
                ..Default::default()
            },
            PolicyFlags {
                dnd: true,
                ..Default::default()
            },
        ] {
            let cmds = commands_for_policy(&flags, AlertMode::High, 5);
            assert_eq!(cmds[0], Command::SetAlertMode(AlertMode::Low));
            assert_eq!(cmds[1], Command::SetAdaptiveMode(true));
        }
    }

    #[test]
    fn test_normal_uses_record_alert() {
        let cmds = commands_for_policy(&PolicyFlags::default(), AlertMode::High, 5);
        assert_eq!(cmds[0], Command::SetAlertMode(AlertMode::High));
        assert!(matches!(
            cmds[2],
            Command::SetPickPocketMode { enabled: false, .. }
        ));
    }

    #[test]
    fn test_alert_suppression() {
        assert!(!PolicyFlags::default().suppresses_alerts());
        assert!(
            PolicyFlags {
                wifi_safe_zone: true,
                ..Default::default()
            }
            .suppresses_alerts()
        );
        assert!(
            !PolicyFlags {
                pick_pocket: true,
                ..Default::default()
            }
            .suppresses_alerts()
        );
    }
}
