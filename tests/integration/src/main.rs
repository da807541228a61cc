mod helpers;

mod cli;
mod membership;
