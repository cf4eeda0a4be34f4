/*!
# Symbion DevKit - Outils de test pour le pipeline télémétrie

- Agents simulés produisant des compteurs cumulés réalistes
- Sink de notifications qui enregistre les lots reçus
- Harness assemblant stockage en mémoire, horloge manuelle, ingestion,
  archiver et moteur d'alertes
*/

pub mod agent_stub;
pub mod test_utils;

pub use agent_stub::{AgentSimulator, RecordingSink};
pub use test_utils::{TestHarness, AGENT_KEY, T0};
