//! `atlas cards` - inspect the card catalog.

use anyhow::Result;
use atlas_server::EngineArgs;
use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum CardsAction {
    /// List loaded cards
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a card definition
    Show {
        /// Card name
        name: String,
    },
}

pub fn run(action: CardsAction, engine: &EngineArgs) -> Result<()> {
    let components = engine.components()?;
    let catalog = engine.catalog(&components)?;

    match action {
        CardsAction::List { json } => {
            let cards = catalog.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&cards)?);
            } else if cards.is_empty() {
                println!("No cards found in {}", engine.cards_dir.display());
            } else {
                println!("Available cards:");
                for card in cards {
                    let steps = format!("{} steps", card.steps);
                    if card.description.is_empty() {
                        println!("  {} v{} ({})", card.name, card.version, steps);
                    } else {
                        println!(
                            "  {} v{} ({}) - {}",
                            card.name, card.version, steps, card.description
                        );
                    }
                }
            }
        }
        CardsAction::Show { name } => {
            let card = catalog.get(&name)?;
            println!("{}", serde_json::to_string_pretty(card.as_ref())?);
        }
    }
    Ok(())
}
