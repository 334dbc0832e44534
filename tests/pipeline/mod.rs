mod client;
mod postgres;
mod reconcile;
