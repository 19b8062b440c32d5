pub mod digitalocean;
pub mod gce;
