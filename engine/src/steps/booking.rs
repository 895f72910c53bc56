//! Table-booking step handlers

use std::sync::Arc;

use async_trait::async_trait;

use sdk::{EngineError, EntityValue};

use super::{StepContext, StepHandler, StepRegistry};

pub const ENTRYPOINT: &str = "book_table_entrypoint";
pub const GET_NB_PERSONS: &str = "book_table_get_nb_persons";
pub const GET_TIME: &str = "book_table_get_time";

/// Largest party the restaurant takes online
const MAX_PARTY_SIZE: i64 = 20;

pub fn register(registry: &mut StepRegistry) {
    registry.register(ENTRYPOINT, Arc::new(Entrypoint));
    registry.register(GET_NB_PERSONS, Arc::new(GetNbPersons));
    registry.register(GET_TIME, Arc::new(GetTime));
}

/// Opens the booking and asks what is missing
pub struct Entrypoint;

#[async_trait]
impl StepHandler for Entrypoint {
    async fn process(&self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        ctx.reply("Sure, let's book a table. How many people will be joining, or when would you like to come?")
            .await
    }
}

/// Records the party size and closes the booking
///
/// Sizes outside `1..=MAX_PARTY_SIZE` are refused with an explanation; the
/// conversation stays where it was so the user can answer again.
pub struct GetNbPersons;

#[async_trait]
impl StepHandler for GetNbPersons {
    async fn process(&self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let Some(nb_persons) = ctx.data().entity("nb_persons").and_then(|e| e.as_integer()) else {
            ctx.reply("Sorry, how many people should I book for?").await?;
            return Err(EngineError::step_rejected(
                GET_NB_PERSONS,
                "nb_persons is not an integer",
            ));
        };

        if !(1..=MAX_PARTY_SIZE).contains(&nb_persons) {
            ctx.reply(format!(
                "We can book tables for 1 to {} people online. How many will you be?",
                MAX_PARTY_SIZE
            ))
            .await?;
            return Err(EngineError::step_rejected(
                GET_NB_PERSONS,
                format!("party size {} is out of range", nb_persons),
            ));
        }

        ctx.reply(format!(
            "A table for {}, noted. The restaurant will confirm the time by message.",
            nb_persons
        ))
        .await?;
        ctx.close();
        Ok(())
    }
}

/// Confirms the date and closes the booking
pub struct GetTime;

#[async_trait]
impl StepHandler for GetTime {
    async fn process(&self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let when = match ctx.data().entity("booking_date").map(|e| &e.value) {
            Some(EntityValue::DateTime { value, .. }) => value.format("%A %e %B at %H:%M").to_string(),
            Some(EntityValue::Interval { from, to }) => format!(
                "{} between {} and {}",
                from.value.format("%A %e %B"),
                from.value.format("%H:%M"),
                to.value.format("%H:%M")
            ),
            _ => {
                ctx.reply("Sorry, which day and time would suit you?").await?;
                return Err(EngineError::step_rejected(
                    GET_TIME,
                    "booking_date is not a date",
                ));
            }
        };

        ctx.reply(format!("You're booked for {}. See you then!", when))
            .await?;
        ctx.close();
        Ok(())
    }
}
