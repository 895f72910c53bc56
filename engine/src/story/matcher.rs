//! Step entry rules
//!
//! Decides whether understanding data satisfies a step's requirements. Pure:
//! no state, no conversation, no I/O.

use sdk::ParsedData;

use super::Step;

/// Whether `data` allows entering `step`
///
/// Rules, in order, stopping at the first failure:
/// 1. an intent that differs from the required one fails
/// 2. a required intent with no intent at all fails
/// 3. no required intent: intent is not looked at
/// 4. every required entity name must be present in the entities
///
/// Entity values are not inspected, only their presence by name.
pub fn can_enter(step: &Step, data: &ParsedData) -> bool {
    if let Some(required) = step.intent() {
        match data.intent_name() {
            Some(intent) if intent != required => return false,
            None => return false,
            Some(_) => {}
        }
    }

    step.required_entities
        .iter()
        .all(|name| data.has_entity(name))
}
