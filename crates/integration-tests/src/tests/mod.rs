mod cli;
mod corruption;
mod explorer;
