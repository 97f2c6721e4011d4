// Wire protocol shared by the relay and browser clients.

pub mod ws;
