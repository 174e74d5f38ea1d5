//! Native program backing the packaged core script
//!
//! Operator commands every install gets: help listing, extension toggles
//! and a raw ping. Registered under the packaged script's key so the core
//! extension is script-sourced like any other and torn down on reload.

use std::sync::Arc;

use crate::domain::entities::{CmdResult, Command, Extension};

use super::bridge::Bridge;
use super::engine::ScriptProgram;

/// Key of the packaged core script, `author:name`
pub const CORE_KEY: &str = "tavern:core";

pub fn core_program() -> ScriptProgram {
    Arc::new(|bridge: &Bridge| {
        let state = bridge.state().clone();

        let mut ext = Extension::new("core", "tavern", "1.0.0");
        ext.brief = "built-in operator commands".to_string();
        ext.active_on_private = true;

        let st = state.clone();
        ext.add_command(
            Command::new("help", move |ctx, _msg, args| {
                let Ok(registry) = st.registry.read() else {
                    return CmdResult::matched_only();
                };
                if let Some(word) = args.arg(0) {
                    for ext in registry.extensions() {
                        if let Some(cmd) = ext.command(word) {
                            ctx.reply(cmd.help_text(false));
                            return CmdResult::solved();
                        }
                    }
                    ctx.reply(format!("unknown command: {word}"));
                    return CmdResult::solved();
                }
                let mut lines = Vec::new();
                for ext in registry.extensions() {
                    lines.push(format!("{} v{}", ext.name, ext.version));
                    for cmd in ext.commands() {
                        let help = cmd.help_text(true);
                        if help.is_empty() {
                            lines.push(format!("  {}", cmd.name));
                        } else {
                            lines.push(format!("  {}: {}", cmd.name, help));
                        }
                    }
                }
                ctx.reply(lines.join("\n"));
                CmdResult::solved()
            })
            .with_short_help("help [command]")
            .with_help("help [command] // list extensions or show one command's help"),
        )?;

        let st = state.clone();
        ext.add_command(
            Command::new("ext", move |ctx, _msg, args| {
                match (args.arg(0), args.arg(1)) {
                    (None, _) | (Some("list"), _) => {
                        let Ok(registry) = st.registry.read() else {
                            return CmdResult::matched_only();
                        };
                        let group = registry.group(&ctx.group_id);
                        let lines: Vec<String> = registry
                            .extensions()
                            .iter()
                            .map(|e| {
                                let on = group.map(|g| g.is_active(&e.name)).unwrap_or(false);
                                format!(
                                    "{} {} v{} by {}",
                                    if on { "[on] " } else { "[off]" },
                                    e.name,
                                    e.version,
                                    e.author
                                )
                            })
                            .collect();
                        ctx.reply(if lines.is_empty() {
                            "no extensions loaded".to_string()
                        } else {
                            lines.join("\n")
                        });
                        CmdResult::solved()
                    }
                    (Some(toggle @ ("on" | "off")), Some(name)) => {
                        let Ok(mut registry) = st.registry.write() else {
                            return CmdResult::matched_only();
                        };
                        let Some(found) = registry.find_by_name_or_alias(name) else {
                            ctx.reply(format!("unknown extension: {name}"));
                            return CmdResult::solved();
                        };
                        let group = registry.group_mut(&ctx.group_id);
                        if toggle == "on" {
                            group.activate(&found.name);
                        } else {
                            group.deactivate(&found.name);
                        }
                        ctx.reply(format!("extension {} is now {}", found.name, toggle));
                        CmdResult::solved()
                    }
                    _ => CmdResult::help(),
                }
            })
            .with_short_help("ext list|on|off [name]")
            .with_help("ext list // show extensions\next on <name> // activate here\next off <name> // deactivate here"),
        )?;

        ext.add_command(
            Command::new("ping", |ctx, _msg, _args| {
                ctx.reply("pong");
                CmdResult::solved()
            })
            .raw()
            .with_short_help("ping // liveness check"),
        )?;

        bridge.ext_register(ext)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::application::state::SharedState;
    use crate::domain::entities::{CommandArgs, Message, ReplySink, User};
    use crate::domain::entities::CmdContext;
    use crate::infrastructure::config::PluginConfigManager;
    use crate::infrastructure::scheduler::TaskScheduler;
    use crate::infrastructure::storage::ExtensionStore;

    fn loaded_bridge() -> Arc<Bridge> {
        let bridge = Arc::new(Bridge::new(
            Arc::new(SharedState::new()),
            Arc::new(ExtensionStore::open_in_memory().unwrap()),
            TaskScheduler::new(),
            Arc::new(Mutex::new(PluginConfigManager::new())),
        ));
        bridge.begin_load(CORE_KEY, true);
        core_program()(&bridge).unwrap();
        bridge.end_load();
        bridge
    }

    fn ctx(sink: &ReplySink) -> CmdContext {
        CmdContext::new("g1", User::from_id("u1"), false, sink.clone())
    }

    fn args(parts: &[&str]) -> CommandArgs {
        CommandArgs {
            command: String::new(),
            args: parts.iter().map(|s| s.to_string()).collect(),
            raw_args: parts.join(" "),
            execute_times: 1,
            mentions: Vec::new(),
        }
    }

    #[test]
    fn core_registers_as_official_script_extension() {
        let bridge = loaded_bridge();
        let core = bridge.ext_find("core").unwrap();
        assert!(core.official);
        assert_eq!(core.source.as_deref(), Some(CORE_KEY));
        assert!(core.command("ping").unwrap().raw);
    }

    #[test]
    fn ext_toggle_round_trip() {
        let bridge = loaded_bridge();
        let core = bridge.ext_find("core").unwrap();
        let sink = ReplySink::new();
        let c = ctx(&sink);
        let msg = Message::from_text("g1", ".ext");

        let toggle = core.command("ext").unwrap();
        let result = (toggle.handler)(&c, &msg, &args(&["off", "core"]));
        assert!(result.solved);
        assert!(!bridge
            .state()
            .registry
            .read()
            .unwrap()
            .group("g1")
            .unwrap()
            .is_active("core"));

        (toggle.handler)(&c, &msg, &args(&["on", "core"]));
        assert!(bridge
            .state()
            .registry
            .read()
            .unwrap()
            .group("g1")
            .unwrap()
            .is_active("core"));
    }

    #[test]
    fn help_lists_commands_and_resolves_one() {
        let bridge = loaded_bridge();
        let core = bridge.ext_find("core").unwrap();
        let sink = ReplySink::new();
        let c = ctx(&sink);
        let msg = Message::from_text("g1", ".help");
        let help = core.command("help").unwrap();

        (help.handler)(&c, &msg, &args(&[]));
        let listing = sink.drain().join("\n");
        assert!(listing.contains("core v1.0.0"));
        assert!(listing.contains("ping"));

        (help.handler)(&c, &msg, &args(&["ext"]));
        assert!(sink.drain().join("\n").contains("ext list"));
    }
}
