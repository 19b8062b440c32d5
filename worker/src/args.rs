use clap::Parser;

use keel_common::args::{NatsArgs, StoreArgs};

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    #[clap(flatten)]
    pub nats: NatsArgs,

    #[clap(flatten)]
    pub store: StoreArgs,
}
