use anyhow::{Context, Result, bail};
use chatgate_agents::{ConversationHandle, TurnInput};
use chatgate_common::{
    Conversation, ConversationId, ConversationUpdate, EntryKind, MAX_RETENTION_DAYS, SystemPrompt,
};
use chatgate_db::ConversationStore;
use chrono::Utc;
use std::sync::Arc;

use crate::bootstrap::Engine;
use crate::transport::TerminalTransport;

pub struct ChatArgs {
    pub conversation: String,
    pub message: String,
    pub new: bool,
    pub model: Option<String>,
    pub attach: Option<String>,
}

pub struct SettingsArgs {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub role: Option<String>,
    pub prompt: Option<String>,
    pub clear_prompt: bool,
    pub retention: Option<u32>,
    pub context_limit: Option<usize>,
    pub streaming: Option<bool>,
}

pub async fn chat(engine: &Engine, user: &str, args: ChatArgs) -> Result<()> {
    let id = ConversationId::from(args.conversation);
    if args.new && engine.conversations.get(&id).await?.is_some() {
        engine.conversations.delete(&id).await?;
    }
    let handle = engine.conversations.get_or_create(&id, user).await?;

    if let Some(model) = args.model {
        ensure_model(engine, &model)?;
        let update = ConversationUpdate {
            model: Some(model),
            ..ConversationUpdate::default()
        };
        engine.conversations.update_settings(&id, update).await?;
    }

    let mut input = TurnInput::text(args.message);
    if let Some(attachment) = args.attach {
        input = input.with_attachment(attachment);
    }

    engine
        .orchestrator
        .answer(&handle, input, Arc::new(TerminalTransport::default()))
        .await
        .context("turn failed")?;
    Ok(())
}

pub async fn history(engine: &Engine, conversation: &str) -> Result<()> {
    let handle = existing(engine, conversation).await?;
    let entries = engine.store.load_live_history(handle.id()).await?;
    if entries.is_empty() {
        println!("(no history)");
        return Ok(());
    }

    for entry in entries {
        let label = match entry.kind {
            EntryKind::Summary => "summary".to_string(),
            EntryKind::System => "system".to_string(),
            EntryKind::Normal => entry.role.as_str().to_string(),
        };
        let stamp = entry.created_at.format("%Y-%m-%d %H:%M");
        println!("[{stamp}] {label}: {}", entry.text());
        for call in &entry.tool_calls {
            println!("    -> {}({}) id={}", call.name, call.arguments, call.id);
        }
        if let Some(attachment) = &entry.attachment {
            println!("    attachment: {attachment}");
        }
    }
    Ok(())
}

pub async fn settings(engine: &Engine, conversation: &str, args: SettingsArgs) -> Result<()> {
    let handle = existing(engine, conversation).await?;
    check_settings(&args, engine.config.engine.keep_recent)?;

    let mut update = ConversationUpdate {
        temperature: args.temperature,
        retention_days: args.retention,
        context_limit: args.context_limit,
        streaming: args.streaming,
        ..ConversationUpdate::default()
    };
    if let Some(model) = args.model {
        ensure_model(engine, &model)?;
        update.model = Some(model);
    }

    if let Some(role) = args.role {
        let prompt = engine
            .config
            .role_prompt(&role)
            .with_context(|| format!("unknown role '{role}'"))?
            .to_string();
        update.system_prompt = Some(Some(SystemPrompt::Role { name: role, prompt }));
    } else if let Some(prompt) = args.prompt {
        update.system_prompt = Some(Some(SystemPrompt::Master { prompt }));
    } else if args.clear_prompt {
        update.system_prompt = Some(None);
    }

    let updated = engine
        .conversations
        .update_settings(handle.id(), update)
        .await?;
    print_settings(&updated);
    Ok(())
}

pub async fn prune(engine: &Engine, conversation: &str) -> Result<()> {
    let handle = existing(engine, conversation).await?;
    let cutoff = handle.read(|c| c.retention_cutoff(Utc::now()));
    let removed = engine.store.prune_expired(handle.id(), cutoff).await?;
    println!("removed {removed} expired entries");
    Ok(())
}

pub async fn delete(engine: &Engine, conversation: &str) -> Result<()> {
    let handle = existing(engine, conversation).await?;
    engine.conversations.delete(handle.id()).await?;
    println!("deleted conversation {}", handle.id());
    Ok(())
}

pub fn models(engine: &Engine) {
    let default = &engine.config.defaults.model;
    for model in &engine.config.models {
        let marker = if &model.name == default { "*" } else { " " };
        let status = if engine.providers.has_adapter(model.family) {
            "ready"
        } else {
            "no credentials"
        };
        let mut traits = Vec::new();
        if model.search.is_some() {
            traits.push("search");
        }
        if model.reasoning {
            traits.push("reasoning");
        }
        println!(
            "{marker} {:<14} {:<18} {:<30} {status} {}",
            model.name,
            model.family.as_str(),
            model.id,
            traits.join(",")
        );
    }
}

pub async fn health(engine: &Engine) {
    let results = engine.providers.health_check_all().await;
    if results.is_empty() {
        println!("no providers configured");
        return;
    }
    for (family, healthy) in results {
        let state = if healthy { "ok" } else { "unreachable" };
        println!("{:<18} {state}", family.as_str());
    }
}

async fn existing(engine: &Engine, conversation: &str) -> Result<ConversationHandle> {
    let id = ConversationId::from(conversation);
    engine
        .conversations
        .get(&id)
        .await?
        .with_context(|| format!("no conversation '{id}'"))
}

fn check_settings(args: &SettingsArgs, keep_recent: usize) -> Result<()> {
    if let Some(temperature) = args.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            bail!("temperature must be between 0 and 2, got {temperature}");
        }
    }
    if let Some(days) = args.retention {
        if days > MAX_RETENTION_DAYS {
            bail!("retention must be at most {MAX_RETENTION_DAYS} days, got {days}");
        }
    }
    if let Some(limit) = args.context_limit {
        let floor = keep_recent + 1;
        if limit <= floor {
            bail!("context limit must be above {floor} so summaries have something to fold");
        }
    }

    Ok(())
}

fn ensure_model(engine: &Engine, name: &str) -> Result<()> {
    if engine.config.model(name).is_none() {
        let known: Vec<&str> = engine.config.models.iter().map(|m| m.name.as_str()).collect();
        bail!("unknown model '{name}', known models: {}", known.join(", "));
    }
    Ok(())
}

fn print_settings(conversation: &Conversation) {
    let prompt = match &conversation.system_prompt {
        Some(SystemPrompt::Role { name, .. }) => format!("role '{name}'"),
        Some(SystemPrompt::Master { .. }) => "custom".to_string(),
        None => "none".to_string(),
    };
    println!("conversation:  {}", conversation.id);
    println!("model:         {}", conversation.model);
    println!("temperature:   {}", conversation.temperature);
    println!("retention:     {} days", conversation.retention_days);
    println!("context limit: {}", conversation.context_limit);
    println!("streaming:     {}", conversation.streaming);
    println!("system prompt: {prompt}");
    println!(
        "tokens used:   {} in / {} out",
        conversation.usage.input_tokens, conversation.usage.output_tokens
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SettingsArgs {
        SettingsArgs {
            model: None,
            temperature: None,
            role: None,
            prompt: None,
            clear_prompt: false,
            retention: None,
            context_limit: None,
            streaming: None,
        }
    }

    #[test]
    fn retention_above_cap_is_refused() {
        let mut settings = args();
        settings.retention = Some(u32::MAX);
        let err = check_settings(&settings, 2).expect_err("huge retention should fail");
        assert!(err.to_string().contains("retention"));

        settings.retention = Some(MAX_RETENTION_DAYS);
        assert!(check_settings(&settings, 2).is_ok());
    }

    #[test]
    fn context_limit_must_leave_room_to_summarize() {
        let mut settings = args();
        settings.context_limit = Some(3);
        assert!(check_settings(&settings, 2).is_err());

        settings.context_limit = Some(4);
        assert!(check_settings(&settings, 2).is_ok());
    }
}
