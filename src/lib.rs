// src/lib.rs

// On déclare tous nos modules principaux pour les rendre publics et
// utilisables par le binaire (activity_monitor.rs) et les tests d'intégration.
pub mod communication;
pub mod config;
pub mod monitor;
pub mod monitoring;
pub mod store;
