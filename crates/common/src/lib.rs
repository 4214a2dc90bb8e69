// pulse-common: wire types shared by chat clients, delivery nodes, and tests

pub mod protocol;
