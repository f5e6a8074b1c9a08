//! Chat demo modules.
//!
//! - `hub` admits users and rebroadcasts their activity and messages.
//! - `chat_client` is started once per admitted user (one instance per username).
//! - `loud_chat_client` inherits `chat_client` and shouts.
//! - `app` talks to the hub and starts/stops client instances through the registry tool.
//!
//! Topics: `hub:access:request|granted|refused`, `user:enter|writing|message|exit`,
//! `hub:user:activity|message`.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use corekit::{Core, Instance, ModuleObject, ModuleRegistry, Tool, Tools};
use mediator::MediatorHandle;

pub const TRANSCRIPT_TOOL: &str = "transcript";
pub const REGISTRY_TOOL: &str = "registry";

/// Lines "displayed" by the chat windows.
#[derive(Clone, Debug, Default)]
pub struct Transcript(Arc<Mutex<Vec<String>>>);

impl Transcript {
    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(target: "chat", "{line}");
        self.0.lock().push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// One scripted user action.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    Join {
        user: String,
        #[serde(default)]
        loud: bool,
    },
    Type {
        user: String,
    },
    Say {
        user: String,
        text: String,
    },
    Leave {
        user: String,
    },
}

pub fn default_script() -> Vec<Step> {
    let user = |u: &str| u.to_string();
    vec![
        Step::Join { user: user("ann"), loud: false },
        Step::Join { user: user("bob"), loud: true },
        Step::Join { user: user(""), loud: false },
        Step::Join { user: user("ann"), loud: false },
        Step::Type { user: user("bob") },
        Step::Say { user: user("ann"), text: "hi bob".into() },
        Step::Say { user: user("bob"), text: "hello ann".into() },
        Step::Leave { user: user("ann") },
        Step::Say { user: user("bob"), text: "anyone?".into() },
    ]
}

/// Reads the script from the `app` start data (`script: [...]`), if present.
pub fn script_from(start_data: &Value) -> Result<Vec<Step>> {
    match start_data.get("script") {
        Some(script) => serde_json::from_value(script.clone()).context("invalid chat script"),
        None => Ok(default_script()),
    }
}

/// Registers the demo tools and defines the chat modules.
pub fn install(core: &Core) -> Result<Transcript> {
    let transcript = Transcript::default();
    let for_tool = transcript.clone();
    core.tools()
        .register(TRANSCRIPT_TOOL, move |_| Ok(Some(Tool::new(for_tool.clone()))))?;

    let registry = core.registry().clone();
    core.tools()
        .register(REGISTRY_TOOL, move |_| Ok(Some(Tool::new(registry.clone()))))?;

    let reg = core.registry();
    define_hub(reg)?;
    define_chat_client(reg)?;
    define_loud_chat_client(reg)?;
    define_app(reg)?;
    Ok(transcript)
}

/// Performs one scripted action. Deliveries it triggers run on the next ticks.
pub fn apply(registry: &ModuleRegistry, step: &Step) -> Result<()> {
    tracing::debug!(target: "chat", ?step, "Script step");
    match step {
        Step::Join { user, loud } => {
            let app = registry
                .get_instance("app", None)?
                .context("app is not started")?;
            app.instance()
                .call("requestAccess", &[json!(user), json!(loud)])?;
        }
        Step::Type { user } => {
            client(registry, user)?.call("type", &[])?;
        }
        Step::Say { user, text } => {
            client(registry, user)?.call("say", &[json!(text)])?;
        }
        Step::Leave { user } => {
            client(registry, user)?.call("exit", &[])?;
        }
    }
    Ok(())
}

fn client(registry: &ModuleRegistry, user: &str) -> Result<Arc<Instance>> {
    for module in ["chat_client", "loud_chat_client"] {
        if let Some(record) = registry.get_instance(module, Some(user))? {
            return Ok(Arc::clone(record.instance()));
        }
    }
    anyhow::bail!("{user} is not in the chat")
}

fn mediator(tools: &Tools, idx: usize) -> Result<Arc<MediatorHandle>> {
    tools
        .get::<MediatorHandle>(idx)
        .context("mediator tool unavailable")
}

fn transcript(tools: &Tools, idx: usize) -> Result<Arc<Transcript>> {
    tools
        .get::<Transcript>(idx)
        .context("transcript tool unavailable")
}

fn text(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn arg(args: &[Value], idx: usize) -> Value {
    args.get(idx).cloned().unwrap_or(Value::Null)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn define_hub(reg: &ModuleRegistry) -> Result<()> {
    reg.define("hub", &["mediator"], |tools| {
        let bus = mediator(tools, 0)?;
        let (start_bus, stop_bus, topic_bus) = (bus.clone(), bus.clone(), bus);

        Ok(ModuleObject::new()
            .field("users", json!({}))
            .method("onStart", move |this, _| {
                let reply = start_bus.clone();
                start_bus.subscribe_with_context("hub:access:request", this, move |this, env| {
                    let username = text(&env.data(), "username");
                    let loud = env.get("loud").and_then(|v| v.as_bool()).unwrap_or(false);
                    let taken = this.update("users", |users| users.get(&username).is_some());

                    let refusal = if taken {
                        Some(format!("The username \"{username}\" is already taken!"))
                    } else if username.is_empty() {
                        Some(format!("The username \"{username}\" is invalid!"))
                    } else {
                        None
                    };

                    match refusal {
                        Some(message) => {
                            let data = json!({ "username": username, "message": message });
                            reply.publish("hub:access:refused", data, false);
                        }
                        None => {
                            let entry = json!({ "entry": now_millis() });
                            this.update("users", |users| users[username.as_str()] = entry);
                            let data = json!({ "username": username, "loud": loud });
                            reply.publish("hub:access:granted", data, false);
                        }
                    }
                    Ok(())
                });

                start_bus.subscribe_with_context("user:enter", this, |this, env| {
                    let user = text(&env.data(), "username");
                    let msg = format!("{user} has joined the chat!");
                    this.call("publishTopic", &[json!("activity"), json!(user), json!(msg)])?;
                    Ok(())
                });
                start_bus.subscribe_with_context("user:writing", this, |this, env| {
                    let user = text(&env.data(), "username");
                    let msg = format!("{user} is writing a message...");
                    this.call("publishTopic", &[json!("activity"), json!(user), json!(msg)])?;
                    Ok(())
                });
                start_bus.subscribe_with_context("user:exit", this, |this, env| {
                    let user = text(&env.data(), "username");
                    this.update("users", |users| {
                        if let Some(map) = users.as_object_mut() {
                            map.remove(&user);
                        }
                    });
                    let msg = format!("{user} has left the chat.");
                    this.call("publishTopic", &[json!("activity"), json!(user), json!(msg)])?;
                    Ok(())
                });
                start_bus.subscribe_with_context("user:message", this, |this, env| {
                    let data = env.data();
                    let (user, message) = (text(&data, "username"), text(&data, "message"));
                    this.call("publishTopic", &[json!("message"), json!(user), json!(message)])?;
                    Ok(())
                });
                Ok(Value::Null)
            })
            .method("publishTopic", move |_, args| {
                let kind = arg(args, 0);
                let topic = format!("hub:user:{}", kind.as_str().unwrap_or("activity"));
                topic_bus.publish(
                    &topic,
                    json!({
                        "timestamp": now_millis(),
                        "username": arg(args, 1),
                        "message": arg(args, 2)
                    }),
                    false,
                );
                Ok(Value::Null)
            })
            .method("onStop", move |_, _| {
                stop_bus.unsubscribe_all();
                Ok(Value::Null)
            }))
    })?;
    Ok(())
}

fn define_chat_client(reg: &ModuleRegistry) -> Result<()> {
    reg.define("chat_client", &["mediator", "transcript"], |tools| {
        let bus = mediator(tools, 0)?;
        let transcript = transcript(tools, 1)?;
        let (start_bus, type_bus, say_bus, exit_bus, stop_bus) =
            (bus.clone(), bus.clone(), bus.clone(), bus.clone(), bus);

        Ok(ModuleObject::new()
            .field("username", "")
            .field("joined_at", Value::Null)
            .method("onStart", move |this, args| {
                let current = this.get_as::<String>("username").unwrap_or_default();
                let username = if !current.is_empty() {
                    current
                } else {
                    let from_data = text(&arg(args, 0), "username");
                    if from_data.is_empty() {
                        arg(args, 1).as_str().unwrap_or_default().to_string()
                    } else {
                        from_data
                    }
                };
                this.set("username", username.as_str());
                this.set("joined_at", now_millis());

                start_bus.publish("user:enter", json!({ "username": username }), false);

                start_bus.subscribe_with_context("hub:user:activity", this, |this, env| {
                    let me = this.get_as::<String>("username").unwrap_or_default();
                    let data = env.data();
                    if text(&data, "username") != me {
                        let line = format!("[{me}] * {}", text(&data, "message"));
                        this.call("display", &[json!(line)])?;
                    }
                    Ok(())
                });
                start_bus.subscribe_with_context("hub:user:message", this, |this, env| {
                    let me = this.get_as::<String>("username").unwrap_or_default();
                    let data = env.data();
                    let from = text(&data, "username");
                    if from != me {
                        let line = format!("[{me}] {from}: {}", text(&data, "message"));
                        this.call("display", &[json!(line)])?;
                    }
                    Ok(())
                });
                Ok(Value::Null)
            })
            .method("type", move |this, _| {
                let me = this.get("username").unwrap_or(Value::Null);
                let data = json!({ "username": me, "timestamp": now_millis() });
                type_bus.publish("user:writing", data, false);
                Ok(Value::Null)
            })
            .method("say", move |this, args| {
                let me = this.get_as::<String>("username").unwrap_or_default();
                let message = arg(args, 0).as_str().unwrap_or_default().to_string();
                this.call("display", &[json!(format!("[{me}] me: {message}"))])?;
                say_bus.publish(
                    "user:message",
                    json!({ "username": me, "message": message, "timestamp": now_millis() }),
                    false,
                );
                Ok(Value::Null)
            })
            .method("exit", move |this, _| {
                let me = this.get("username").unwrap_or(Value::Null);
                exit_bus.publish("user:exit", json!({ "username": me }), false);
                Ok(Value::Null)
            })
            .method("display", move |_, args| {
                if let Some(line) = arg(args, 0).as_str() {
                    transcript.push(line);
                }
                Ok(Value::Null)
            })
            .method("onStop", move |_, _| {
                stop_bus.unsubscribe_all();
                Ok(Value::Null)
            })
            .method("onDestroy", |this, _| {
                let me = this.get_as::<String>("username").unwrap_or_default();
                this.call("display", &[json!(format!("[{me}] window closed"))])?;
                this.set("joined_at", Value::Null);
                Ok(Value::Null)
            }))
    })?;
    Ok(())
}

fn define_loud_chat_client(reg: &ModuleRegistry) -> Result<()> {
    reg.inherit("chat_client", "loud_chat_client", &[], |_| {
        Ok(ModuleObject::new()
            .method("onStart", |this, args| {
                this.call_super(args)?;
                let me = this.get_as::<String>("username").unwrap_or_default();
                this.call("display", &[json!(format!("[{me}] (loud mode)"))])?;
                Ok(Value::Null)
            })
            .method("say", |this, args| {
                let message = arg(args, 0).as_str().unwrap_or_default().to_uppercase();
                this.call_super(&[json!(format!("{message}!"))])
            }))
    })?;
    Ok(())
}

fn define_app(reg: &ModuleRegistry) -> Result<()> {
    reg.define("app", &["mediator", "registry", "transcript"], |tools| {
        let bus = mediator(tools, 0)?;
        let registry = tools
            .get::<ModuleRegistry>(1)
            .context("registry tool unavailable")?;
        let transcript = transcript(tools, 2)?;
        let (start_bus, request_bus, stop_bus) = (bus.clone(), bus.clone(), bus);
        let start_registry = Arc::clone(&registry);

        Ok(ModuleObject::new()
            .field("clients", json!({}))
            .method("onStart", move |this, _| {
                let registry = Arc::clone(&start_registry);
                start_bus.subscribe_with_context("hub:access:granted", this, move |this, env| {
                    let username = text(&env.data(), "username");
                    let loud = env.get("loud").and_then(|v| v.as_bool()).unwrap_or(false);
                    let module = if loud { "loud_chat_client" } else { "chat_client" };

                    registry
                        .instances()
                        .start_instance(module, &username, json!({ "username": username }))?;
                    this.update("clients", |clients| clients[username.as_str()] = json!(module));
                    Ok(())
                });

                let refused = Arc::clone(&transcript);
                start_bus.subscribe("hub:access:refused", move |env| {
                    let message = text(&env.data(), "message");
                    tracing::warn!(target: "chat", %message, "Access refused");
                    refused.push(format!("[app] access refused: {message}"));
                    Ok(())
                });

                let registry = Arc::clone(&start_registry);
                start_bus.subscribe_with_context("user:exit", this, move |this, env| {
                    let username = text(&env.data(), "username");
                    let module = this.update("clients", |clients| {
                        clients
                            .as_object_mut()
                            .and_then(|map| map.remove(&username))
                    });
                    if let Some(module) = module.as_ref().and_then(Value::as_str) {
                        registry.instances().stop_instance(module, &username, true)?;
                    }
                    Ok(())
                });

                start_registry.start("hub", Value::Null)?;
                Ok(Value::Null)
            })
            .method("requestAccess", move |_, args| {
                request_bus.publish(
                    "hub:access:request",
                    json!({
                        "username": arg(args, 0),
                        "loud": arg(args, 1).as_bool().unwrap_or(false)
                    }),
                    false,
                );
                Ok(Value::Null)
            })
            .method("onStop", move |this, _| {
                let clients = this.update("clients", std::mem::take);
                if let Some(map) = clients.as_object() {
                    for (username, module) in map {
                        if let Some(module) = module.as_str() {
                            registry.instances().stop_instance(module, username, true)?;
                        }
                    }
                }
                this.set("clients", json!({}));
                registry.stop("hub", false)?;
                stop_bus.unsubscribe_all();
                Ok(Value::Null)
            }))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corekit::TickQueue;

    fn chat(debug: bool) -> (Core, Arc<TickQueue>, Transcript) {
        let core = Core::with_debug_mode(debug);
        let queue = Arc::new(TickQueue::new());
        mediator::install(&core, queue.clone()).unwrap();
        let transcript = install(&core).unwrap();
        core.registry().start("app", Value::Null).unwrap();
        queue.run_until_idle().unwrap();
        (core, queue, transcript)
    }

    fn run(core: &Core, queue: &TickQueue, steps: &[Step]) {
        for step in steps {
            apply(core.registry(), step).unwrap();
            queue.run_until_idle().unwrap();
        }
    }

    #[test]
    fn default_script_conversation() {
        let (core, queue, transcript) = chat(true);
        run(&core, &queue, &default_script());

        let lines = transcript.lines();
        for expected in [
            "[bob] (loud mode)",
            "[ann] * bob has joined the chat!",
            "[app] access refused: The username \"\" is invalid!",
            "[app] access refused: The username \"ann\" is already taken!",
            "[ann] * bob is writing a message...",
            "[ann] me: hi bob",
            "[bob] ann: hi bob",
            "[bob] me: HELLO ANN!",
            "[ann] bob: HELLO ANN!",
            "[ann] window closed",
            "[bob] * ann has left the chat.",
            "[bob] me: ANYONE?!",
        ] {
            assert!(lines.iter().any(|l| l == expected), "missing {expected:?} in {lines:#?}");
        }
        assert!(!lines.iter().any(|l| l == "[ann] bob: ANYONE?!"));
    }

    #[test]
    fn leaving_destroys_only_that_instance() {
        let (core, queue, _) = chat(true);
        let reg = core.registry();
        run(
            &core,
            &queue,
            &[
                Step::Join { user: "ann".into(), loud: false },
                Step::Join { user: "cid".into(), loud: false },
                Step::Leave { user: "ann".into() },
            ],
        );

        assert!(reg.get_instance("chat_client", Some("ann")).unwrap().is_none());
        let cid = reg.get_instance("chat_client", Some("cid")).unwrap().unwrap();
        assert!(cid.is_started());
        assert!(reg.is_defined("chat_client"));

        let hub = reg.get_instance("hub", None).unwrap().unwrap();
        assert_eq!(hub.instance().get("users").unwrap().get("ann"), None);
    }

    #[test]
    fn stopping_the_app_tears_everything_down() {
        let (core, queue, transcript) = chat(false);
        let reg = core.registry();
        run(&core, &queue, &default_script()[..2]);

        assert!(reg.stop("app", false).unwrap());
        queue.run_until_idle().unwrap();

        assert!(!reg.get_instance("hub", None).unwrap().unwrap().is_started());
        assert_eq!(reg.instance_names("chat_client"), Some(vec![]));
        assert_eq!(reg.instance_names("loud_chat_client"), Some(vec![]));
        assert!(transcript.lines().contains(&"[bob] window closed".to_string()));
    }

    #[test]
    fn destroy_all_leaves_nothing_behind() {
        let (core, queue, transcript) = chat(true);
        let reg = core.registry();
        run(&core, &queue, &default_script()[..2]);

        assert!(reg.destroy_all(None).unwrap());
        queue.run_until_idle().unwrap();

        assert!(reg.module_names().is_empty());
        let lines = transcript.lines();
        assert!(lines.contains(&"[ann] window closed".to_string()));
        assert!(lines.contains(&"[bob] window closed".to_string()));
    }

    #[test]
    fn script_is_read_from_start_data() {
        let data = json!({ "script": [
            { "action": "join", "user": "zoe" },
            { "action": "say", "user": "zoe", "text": "hey" },
        ]});
        let steps = script_from(&data).unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Join { user: "zoe".into(), loud: false },
                Step::Say { user: "zoe".into(), text: "hey".into() },
            ]
        );
        assert_eq!(script_from(&Value::Null).unwrap(), default_script());
        assert!(script_from(&json!({ "script": [{ "action": "dance" }] })).is_err());
    }
}
