//! Interactive setup wizard for dropline configuration

use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password, Select};
use dropline_core::config::{save_config_to, AuthConfig, UploadConfig};
use dropline_core::{ConfigFile, DropboxClient, WriteMode};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

/// Run the interactive setup wizard
pub async fn run_init_wizard(config_path: &Path) -> Result<()> {
    println!("🚀 Welcome to dropline setup!\n");

    println!("This wizard will guide you through the configuration process.");
    println!("You will need a Dropbox access token, pasted directly or stored in a file.");
    println!("Generate one from your app page at https://www.dropbox.com/developers/apps\n");

    // Step 1: token source
    let auth = prompt_auth()?;

    // Step 2: upload defaults
    let upload = prompt_upload_defaults()?;

    // Summary
    println!("\n📋 Configuration summary:");
    println!(
        "  Auth: {}",
        match &auth.token_file {
            Some(file) => format!("token file {}", file),
            None => "token stored in config".to_string(),
        }
    );
    println!("  Write mode: {}", upload.mode);
    println!("  Autorename: {}", upload.autorename);
    println!("  Config file: {}", config_path.display());

    let config = ConfigFile {
        auth,
        upload: Some(upload),
        ..ConfigFile::default()
    };

    // Optional token check before saving
    let check = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Check the token against Dropbox now?")
        .default(true)
        .interact()?;
    if check {
        check_token(&config).await?;
    }

    let confirm = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Save this configuration?")
        .default(true)
        .interact()?;

    if !confirm {
        println!("❌ Configuration cancelled");
        return Ok(());
    }

    save_config_to(&config, config_path)?;
    println!("✅ Configuration saved!");

    println!("\n🎉 Setup complete!");
    println!("\nYou can now use dropline:");
    println!("  $ dropline upload report.pdf --to /Documents");
    println!("  $ dropline download /Documents/report.pdf");
    println!("  $ dropline share /Documents/report.pdf");

    Ok(())
}

async fn check_token(config: &ConfigFile) -> Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("Checking token...");

    let token = dropline_core::resolve_token(config, None)?;
    let result = DropboxClient::new(token)?.validate().await;

    match result {
        Ok(()) => {
            pb.finish_with_message("✅ Token accepted");
            Ok(())
        }
        Err(e) => {
            pb.finish_with_message("❌ Token rejected");
            Err(e.into())
        }
    }
}

/// Prompt for the token or a token file
fn prompt_auth() -> Result<AuthConfig> {
    let methods = vec!["Paste the access token", "Read the token from a file"];

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Token source")
        .items(&methods)
        .default(0)
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to select token source: {}", e))?;

    if selection == 0 {
        let token = Password::with_theme(&ColorfulTheme::default())
            .with_prompt("Access token")
            .validate_with(|input: &String| -> Result<(), &str> {
                if input.trim().is_empty() {
                    Err("Access token cannot be empty")
                } else if input.chars().any(char::is_whitespace) {
                    Err("Access token cannot contain whitespace")
                } else {
                    Ok(())
                }
            })
            .interact()
            .map_err(|e| anyhow::anyhow!("Failed to get access token: {}", e))?;

        return Ok(AuthConfig {
            token: Some(token),
            token_file: None,
        });
    }

    let file = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Token file")
        .default("~/.dropbox_token".to_string())
        .validate_with(|input: &String| -> Result<(), String> {
            let path = dropline_core::config::expand_home(input);
            dropline_core::config::read_token_file(&path)
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .interact_text()
        .map_err(|e| anyhow::anyhow!("Failed to get token file: {}", e))?;

    Ok(AuthConfig {
        token: None,
        token_file: Some(file),
    })
}

/// Prompt for batch upload defaults
fn prompt_upload_defaults() -> Result<UploadConfig> {
    let modes = vec!["add", "overwrite"];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Default write mode")
        .items(&modes)
        .default(0)
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to select write mode: {}", e))?;

    let autorename = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Rename uploads automatically on conflict?")
        .default(false)
        .interact()?;

    let mode = modes[selection].parse::<WriteMode>()?;

    Ok(UploadConfig {
        mode: mode.to_string(),
        autorename,
        ..UploadConfig::default()
    })
}
