pub mod graph_conv;
